use std::path::PathBuf;
use std::time::Duration;

/// How the engine persists committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Nothing is written to disk.
    Disabled,
    /// Periodic snapshots only; commits between snapshots are lost on crash.
    PeriodicSnapshot,
    /// Periodic snapshots plus a write-ahead log appended at every commit.
    PeriodicSnapshotWithWal,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `snapshots/`, `wal/` and the `.lock` file.
    pub data_directory: PathBuf,
    pub durability_mode: DurabilityMode,
    /// Rebuild state from the newest valid snapshot plus the WAL suffix on
    /// startup. When disabled and durable files exist they are moved into
    /// `.backup/` instead of being overwritten.
    pub recover_on_startup: bool,
    pub snapshot_interval: Duration,
    /// How many finished snapshots to keep; older ones are deleted.
    pub snapshot_retention_count: usize,
    pub snapshot_on_exit: bool,
    /// A WAL segment is finalized once its on-disk size crosses this many
    /// bytes. Finalization also happens on snapshot creation and shutdown.
    pub wal_segment_size: u64,
    /// Fsync the WAL on every commit instead of only on segment
    /// finalization. Commits always reach the OS before they are published.
    pub strict_sync: bool,
    pub gc_interval: Duration,
    /// Run the garbage collector on a background thread. Manual cycles via
    /// `Storage::run_gc` work either way.
    pub periodic_gc: bool,
    /// Whether edges carry property maps. Off means edges exist purely as
    /// adjacency and `EdgeRef::set_property` fails.
    pub properties_on_edges: bool,
    /// Deadline applied to every transaction; `None` means unbounded.
    pub transaction_timeout: Option<Duration>,
}

impl Config {
    /// Purely in-memory engine: no durability, background GC enabled.
    pub fn in_memory(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            durability_mode: DurabilityMode::Disabled,
            recover_on_startup: false,
            snapshot_interval: Duration::from_secs(300),
            snapshot_retention_count: 3,
            snapshot_on_exit: false,
            wal_segment_size: 16 * 1024 * 1024,
            strict_sync: false,
            gc_interval: Duration::from_secs(1),
            periodic_gc: true,
            properties_on_edges: true,
            transaction_timeout: None,
        }
    }

    /// Snapshots plus WAL, recovery on startup. The usual durable setup.
    pub fn durable(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            durability_mode: DurabilityMode::PeriodicSnapshotWithWal,
            recover_on_startup: true,
            snapshot_on_exit: true,
            ..Self::in_memory(data_directory)
        }
    }

    /// Durable setup that additionally fsyncs the WAL on every commit.
    pub fn strict(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            strict_sync: true,
            ..Self::durable(data_directory)
        }
    }

    pub(crate) fn durability_enabled(&self) -> bool {
        self.durability_mode != DurabilityMode::Disabled
    }

    pub(crate) fn wal_enabled(&self) -> bool {
        self.durability_mode == DurabilityMode::PeriodicSnapshotWithWal
    }
}
