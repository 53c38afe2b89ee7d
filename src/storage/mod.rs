pub(crate) mod accessor;
mod commit_log;
pub(crate) mod constraints;
pub(crate) mod delta;
pub(crate) mod edge;
mod gc;
pub(crate) mod index;
pub(crate) mod transaction;
pub(crate) mod vertex;

pub use accessor::{Accessor, EdgeRef, VertexRef};
pub use gc::GcStats;
pub use transaction::{IsolationLevel, StorageMode};

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::durability::snapshot::{self, SnapshotContents, SnapshotEdgeRec, SnapshotVertexRec};
use crate::durability::wal::{WalRecord, WalWriter};
use crate::durability::{self, recovery};
use crate::error::{Error, Result};
use crate::ids::{EdgeTypeId, Gid, LabelId, NameIdMapper, PropertyId};
use crate::scheduler::Scheduler;
use crate::storage::commit_log::CommitLog;
use crate::storage::constraints::Constraints;
use crate::storage::delta::{Delta, DeltaAction, DeltaOwner, TRANSACTION_INITIAL_ID};
use crate::storage::edge::Edge;
use crate::storage::index::Indices;
use crate::storage::vertex::Vertex;
use crate::value::PropertyValue;

/// Which state a read observes relative to the reading transaction's own
/// uncommitted writes: `Old` is the state as of the transaction's view,
/// `New` additionally includes the transaction's own writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Old,
    New,
}

/// Why a snapshot was not created.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("periodic snapshots are disabled while analytical accessors are active")]
    DisabledForAnalyticalPeriodic,
    #[error(transparent)]
    Failure(#[from] Error),
}

/// Aggregate counters over the stored graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageInfo {
    pub vertex_count: u64,
    pub edge_count: u64,
    pub average_degree: f64,
}

/// A committed transaction awaiting garbage collection: the shared commit
/// cell plus the delta arena, queued in commit order.
pub(crate) struct FinishedTransaction {
    pub(crate) commit_cell: Arc<AtomicU64>,
    pub(crate) deltas: Vec<Arc<Delta>>,
}

pub(crate) struct StorageInner {
    pub(crate) config: Config,
    pub(crate) uuid: RwLock<String>,
    pub(crate) epoch_id: RwLock<String>,

    pub(crate) vertices: RwLock<BTreeMap<Gid, Arc<Vertex>>>,
    pub(crate) edges: RwLock<BTreeMap<Gid, Arc<Edge>>>,

    /// Short critical section for timestamp/id assignment, WAL ordering and
    /// commit publication.
    pub(crate) engine_lock: Mutex<()>,
    /// Held shared by accessors and GC, exclusively by schema operations.
    pub(crate) main_lock: Arc<RwLock<()>>,
    pub(crate) gc_lock: Mutex<()>,

    pub(crate) timestamp: AtomicU64,
    pub(crate) transaction_id: AtomicU64,
    pub(crate) vertex_id: AtomicU64,
    pub(crate) edge_id: AtomicU64,
    pub(crate) edge_count: AtomicU64,
    pub(crate) last_commit_timestamp: AtomicU64,

    pub(crate) name_id_mapper: NameIdMapper,
    pub(crate) commit_log: CommitLog,
    pub(crate) indices: Indices,
    pub(crate) constraints: Constraints,

    pub(crate) committed_transactions: Mutex<VecDeque<FinishedTransaction>>,
    pub(crate) garbage_undo_buffers: Mutex<VecDeque<(u64, Vec<Arc<Delta>>)>>,
    pub(crate) deleted_vertices: Mutex<Vec<Gid>>,
    pub(crate) deleted_edges: Mutex<Vec<Gid>>,
    pub(crate) garbage_vertices: Mutex<VecDeque<(u64, Gid)>>,
    pub(crate) analytical_deleted_vertices: Mutex<Vec<Gid>>,
    pub(crate) analytical_deleted_edges: Mutex<Vec<Gid>>,

    pub(crate) wal: Mutex<Option<WalWriter>>,
    pub(crate) wal_seq: AtomicU64,
    /// Blocks WAL writes until recovery has finished replaying.
    pub(crate) durability_ready: AtomicBool,
    pub(crate) analytical_accessors: AtomicUsize,
    pub(crate) last_gc_stats: Mutex<Option<GcStats>>,
    pub(crate) lock_file: Mutex<Option<File>>,
}

impl StorageInner {
    fn new(config: Config) -> Self {
        Self {
            config,
            uuid: RwLock::new(Uuid::new_v4().to_string()),
            epoch_id: RwLock::new(Uuid::new_v4().to_string()),
            vertices: RwLock::new(BTreeMap::new()),
            edges: RwLock::new(BTreeMap::new()),
            engine_lock: Mutex::new(()),
            main_lock: Arc::new(RwLock::new(())),
            gc_lock: Mutex::new(()),
            timestamp: AtomicU64::new(0),
            transaction_id: AtomicU64::new(TRANSACTION_INITIAL_ID),
            vertex_id: AtomicU64::new(0),
            edge_id: AtomicU64::new(0),
            edge_count: AtomicU64::new(0),
            last_commit_timestamp: AtomicU64::new(0),
            name_id_mapper: NameIdMapper::new(),
            commit_log: CommitLog::new(0),
            indices: Indices::default(),
            constraints: Constraints::default(),
            committed_transactions: Mutex::new(VecDeque::new()),
            garbage_undo_buffers: Mutex::new(VecDeque::new()),
            deleted_vertices: Mutex::new(Vec::new()),
            deleted_edges: Mutex::new(Vec::new()),
            garbage_vertices: Mutex::new(VecDeque::new()),
            analytical_deleted_vertices: Mutex::new(Vec::new()),
            analytical_deleted_edges: Mutex::new(Vec::new()),
            wal: Mutex::new(None),
            wal_seq: AtomicU64::new(0),
            durability_ready: AtomicBool::new(false),
            analytical_accessors: AtomicUsize::new(0),
            last_gc_stats: Mutex::new(None),
            lock_file: Mutex::new(None),
        }
    }

    /// Assigns a commit timestamp. With a desired timestamp (ingest path)
    /// the clock is advanced past it; otherwise the clock value is taken
    /// and incremented. Callers hold the engine lock.
    pub(crate) fn commit_timestamp(&self, desired: Option<u64>) -> u64 {
        match desired {
            None => self.timestamp.fetch_add(1, Ordering::AcqRel),
            Some(desired) => {
                self.timestamp.fetch_max(desired + 1, Ordering::AcqRel);
                desired
            }
        }
    }

    pub(crate) fn collect_vertices(&self) -> Vec<Arc<Vertex>> {
        self.vertices.read().values().cloned().collect()
    }

    pub(crate) fn label_name(&self, label: LabelId) -> String {
        self.name_id_mapper
            .id_to_name(label.as_u32())
            .unwrap_or_default()
    }

    pub(crate) fn property_name(&self, property: PropertyId) -> String {
        self.name_id_mapper
            .id_to_name(property.as_u32())
            .unwrap_or_default()
    }

    pub(crate) fn edge_type_name(&self, edge_type: EdgeTypeId) -> String {
        self.name_id_mapper
            .id_to_name(edge_type.as_u32())
            .unwrap_or_default()
    }

    // ---- WAL write path ---------------------------------------------

    fn ensure_wal_writer<'a>(
        &self,
        slot: &'a mut Option<WalWriter>,
        first_timestamp: u64,
    ) -> Result<&'a mut WalWriter> {
        if slot.is_none() {
            let sequence_number = self.wal_seq.fetch_add(1, Ordering::AcqRel);
            *slot = Some(WalWriter::create(
                &durability::wal_directory(&self.config.data_directory),
                &self.uuid.read(),
                &self.epoch_id.read(),
                sequence_number,
                first_timestamp,
            )?);
        }
        Ok(slot.as_mut().expect("writer just ensured"))
    }

    fn maybe_rotate_wal(&self, slot: &mut Option<WalWriter>) -> Result<()> {
        let oversized = slot
            .as_ref()
            .map(|writer| writer.size() >= self.config.wal_segment_size)
            .unwrap_or(false);
        if oversized {
            let writer = slot.take().expect("writer present");
            writer.finalize()?;
        }
        Ok(())
    }

    /// Appends one committed transaction to the WAL. Called under the
    /// engine lock so record order equals commit order; the commit
    /// timestamp is published only after these bytes reached the OS.
    pub(crate) fn wal_append_transaction(
        &self,
        deltas: &[Arc<Delta>],
        commit_timestamp: u64,
    ) -> Result<()> {
        if !self.config.wal_enabled() || !self.durability_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let records = self.records_for_transaction(deltas);
        if records.is_empty() {
            return Ok(());
        }
        let mut slot = self.wal.lock();
        let writer = self.ensure_wal_writer(&mut slot, commit_timestamp)?;
        for record in &records {
            writer.append(commit_timestamp, record)?;
        }
        writer.append(commit_timestamp, &WalRecord::TransactionEnd)?;
        writer.flush()?;
        if self.config.strict_sync {
            writer.sync()?;
        }
        self.maybe_rotate_wal(&mut slot)
    }

    fn wal_append_schema(&self, record: &WalRecord, timestamp: u64) -> Result<()> {
        if !self.config.wal_enabled() || !self.durability_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut slot = self.wal.lock();
        let writer = self.ensure_wal_writer(&mut slot, timestamp)?;
        writer.append(timestamp, record)?;
        writer.flush()?;
        if self.config.strict_sync {
            writer.sync()?;
        }
        self.maybe_rotate_wal(&mut slot)
    }

    /// Converts a transaction's inverse deltas into forward WAL records in
    /// replayable order: vertex creations, edge creations, label/property
    /// mutations, edge deletions, vertex deletions. An edge both created
    /// and deleted by the same transaction keeps only the half matching its
    /// final adjacency state (endpoint moves re-create the same gid).
    fn records_for_transaction(&self, deltas: &[Arc<Delta>]) -> Vec<WalRecord> {
        struct EdgeWalInfo {
            gid: Gid,
            edge_type: EdgeTypeId,
            from: Gid,
            to: Gid,
            from_vertex: Arc<Vertex>,
        }

        let mut records = Vec::new();
        let mut creations: Vec<EdgeWalInfo> = Vec::new();
        let mut deletions: Vec<EdgeWalInfo> = Vec::new();

        for delta in deltas {
            if let DeltaOwner::Vertex(weak) = &delta.owner {
                let Some(vertex) = weak.upgrade() else { continue };
                match &delta.action {
                    DeltaAction::RemoveOutEdge(entry) => creations.push(EdgeWalInfo {
                        gid: entry.edge.gid(),
                        edge_type: entry.edge_type,
                        from: vertex.gid,
                        to: entry.neighbor,
                        from_vertex: vertex,
                    }),
                    DeltaAction::AddOutEdge(entry) => deletions.push(EdgeWalInfo {
                        gid: entry.edge.gid(),
                        edge_type: entry.edge_type,
                        from: vertex.gid,
                        to: entry.neighbor,
                        from_vertex: vertex,
                    }),
                    _ => {}
                }
            }
        }

        // An endpoint move re-creates the same edge gid inside one
        // transaction; keep only the newest creation per gid (the final
        // adjacency position) so replay never sees a duplicate gid.
        let mut deduped_creations: Vec<EdgeWalInfo> = Vec::new();
        for creation in creations.into_iter().rev() {
            if deduped_creations
                .iter()
                .any(|existing| existing.gid == creation.gid)
            {
                continue;
            }
            deduped_creations.push(creation);
        }
        deduped_creations.sort_by_key(|info| {
            // Among same-gid candidates (already deduped) ordering is only
            // cosmetic; keep creations in gid order for stable replay.
            info.gid
        });
        let creations = deduped_creations;
        let mut deduped_deletions: Vec<EdgeWalInfo> = Vec::new();
        for deletion in deletions.into_iter().rev() {
            if deduped_deletions
                .iter()
                .any(|existing| existing.gid == deletion.gid)
            {
                continue;
            }
            deduped_deletions.push(deletion);
        }
        let deletions = deduped_deletions;

        // Pass 1: vertex creations.
        for delta in deltas {
            if let DeltaOwner::Vertex(weak) = &delta.owner {
                if matches!(
                    delta.action,
                    DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject
                ) {
                    if let Some(vertex) = weak.upgrade() {
                        records.push(WalRecord::VertexCreate { gid: vertex.gid });
                    }
                }
            }
        }

        // Pass 2: edge creations.
        for creation in &creations {
            records.push(WalRecord::EdgeCreate {
                gid: creation.gid,
                edge_type: self.edge_type_name(creation.edge_type),
                from: creation.from,
                to: creation.to,
            });
        }

        // Pass 3: label and property mutations. Property records carry the
        // object's current (committed) value, not the delta's inverse.
        for delta in deltas {
            match (&delta.action, &delta.owner) {
                (DeltaAction::RemoveLabel(label), DeltaOwner::Vertex(weak)) => {
                    if let Some(vertex) = weak.upgrade() {
                        records.push(WalRecord::VertexAddLabel {
                            gid: vertex.gid,
                            label: self.label_name(*label),
                        });
                    }
                }
                (DeltaAction::AddLabel(label), DeltaOwner::Vertex(weak)) => {
                    if let Some(vertex) = weak.upgrade() {
                        records.push(WalRecord::VertexRemoveLabel {
                            gid: vertex.gid,
                            label: self.label_name(*label),
                        });
                    }
                }
                (DeltaAction::SetProperty { key, .. }, DeltaOwner::Vertex(weak)) => {
                    if let Some(vertex) = weak.upgrade() {
                        let value = vertex
                            .payload
                            .lock()
                            .properties
                            .get(key)
                            .cloned()
                            .unwrap_or(PropertyValue::Null);
                        records.push(WalRecord::VertexSetProperty {
                            gid: vertex.gid,
                            property: self.property_name(*key),
                            value,
                        });
                    }
                }
                (DeltaAction::SetProperty { key, .. }, DeltaOwner::Edge(weak)) => {
                    if let Some(edge) = weak.upgrade() {
                        let value = edge
                            .payload
                            .lock()
                            .properties
                            .get(key)
                            .cloned()
                            .unwrap_or(PropertyValue::Null);
                        records.push(WalRecord::EdgeSetProperty {
                            gid: edge.gid,
                            property: self.property_name(*key),
                            value,
                        });
                    }
                }
                _ => {}
            }
        }

        // Pass 4: edge deletions.
        for deletion in &deletions {
            if let Some(creation) = creations
                .iter()
                .find(|creation| creation.gid == deletion.gid)
            {
                let finally_present = creation
                    .from_vertex
                    .payload
                    .lock()
                    .out_edges
                    .iter()
                    .any(|entry| entry.edge.gid() == creation.gid);
                if finally_present {
                    continue;
                }
            }
            records.push(WalRecord::EdgeDelete {
                gid: deletion.gid,
                edge_type: self.edge_type_name(deletion.edge_type),
                from: deletion.from,
                to: deletion.to,
            });
        }

        // Pass 5: vertex deletions.
        for delta in deltas {
            if let (DeltaAction::RecreateObject, DeltaOwner::Vertex(weak)) =
                (&delta.action, &delta.owner)
            {
                if let Some(vertex) = weak.upgrade() {
                    records.push(WalRecord::VertexDelete { gid: vertex.gid });
                }
            }
        }

        records
    }

    fn schema_commit(&self, record: WalRecord, desired: Option<u64>) -> Result<()> {
        let _engine = self.engine_lock.lock();
        let timestamp = self.commit_timestamp(desired);
        // The timestamp is consumed whether or not the WAL append succeeds;
        // it must be marked finished on both paths or the oldest-active
        // fence stalls on the wasted bit.
        let result = self.wal_append_schema(&record, timestamp);
        self.commit_log.mark_finished(timestamp);
        if result.is_ok() {
            self.last_commit_timestamp.store(timestamp, Ordering::Release);
        }
        result
    }

    // ---- schema operations ------------------------------------------

    pub(crate) fn create_label_index(&self, label: LabelId, desired: Option<u64>) -> Result<()> {
        let _guard = self.main_lock.write();
        let vertices = self.collect_vertices();
        if !self.indices.label.create(label, &vertices) {
            return Err(Error::IndexDefinition("label index already exists"));
        }
        info!(label = %label, "storage.index.label_created");
        self.schema_commit(
            WalRecord::LabelIndexCreate {
                label: self.label_name(label),
            },
            desired,
        )
    }

    pub(crate) fn drop_label_index(&self, label: LabelId, desired: Option<u64>) -> Result<()> {
        let _guard = self.main_lock.write();
        if !self.indices.label.drop_index(label) {
            return Err(Error::IndexDefinition("label index does not exist"));
        }
        self.schema_commit(
            WalRecord::LabelIndexDrop {
                label: self.label_name(label),
            },
            desired,
        )
    }

    pub(crate) fn create_label_property_index(
        &self,
        label: LabelId,
        property: PropertyId,
        desired: Option<u64>,
    ) -> Result<()> {
        let _guard = self.main_lock.write();
        let vertices = self.collect_vertices();
        if !self.indices.label_property.create(label, property, &vertices) {
            return Err(Error::IndexDefinition("label+property index already exists"));
        }
        info!(label = %label, property = %property, "storage.index.label_property_created");
        self.schema_commit(
            WalRecord::LabelPropertyIndexCreate {
                label: self.label_name(label),
                property: self.property_name(property),
            },
            desired,
        )
    }

    pub(crate) fn drop_label_property_index(
        &self,
        label: LabelId,
        property: PropertyId,
        desired: Option<u64>,
    ) -> Result<()> {
        let _guard = self.main_lock.write();
        if !self.indices.label_property.drop_index(label, property) {
            return Err(Error::IndexDefinition("label+property index does not exist"));
        }
        self.schema_commit(
            WalRecord::LabelPropertyIndexDrop {
                label: self.label_name(label),
                property: self.property_name(property),
            },
            desired,
        )
    }

    pub(crate) fn create_existence_constraint(
        &self,
        label: LabelId,
        property: PropertyId,
        desired: Option<u64>,
    ) -> Result<()> {
        let _guard = self.main_lock.write();
        let vertices = self.collect_vertices();
        if !self
            .constraints
            .existence
            .create(label, property, &vertices)?
        {
            return Err(Error::ConstraintDefinition(
                "existence constraint already exists",
            ));
        }
        self.schema_commit(
            WalRecord::ExistenceConstraintCreate {
                label: self.label_name(label),
                property: self.property_name(property),
            },
            desired,
        )
    }

    pub(crate) fn drop_existence_constraint(
        &self,
        label: LabelId,
        property: PropertyId,
        desired: Option<u64>,
    ) -> Result<()> {
        let _guard = self.main_lock.write();
        if !self.constraints.existence.drop_constraint(label, property) {
            return Err(Error::ConstraintDefinition(
                "existence constraint does not exist",
            ));
        }
        self.schema_commit(
            WalRecord::ExistenceConstraintDrop {
                label: self.label_name(label),
                property: self.property_name(property),
            },
            desired,
        )
    }

    pub(crate) fn create_unique_constraint(
        &self,
        label: LabelId,
        properties: &[PropertyId],
        desired: Option<u64>,
    ) -> Result<()> {
        let _guard = self.main_lock.write();
        let vertices = self.collect_vertices();
        if !self.constraints.unique.create(label, properties, &vertices)? {
            return Err(Error::ConstraintDefinition(
                "unique constraint already exists",
            ));
        }
        self.schema_commit(
            WalRecord::UniqueConstraintCreate {
                label: self.label_name(label),
                properties: properties.iter().map(|p| self.property_name(*p)).collect(),
            },
            desired,
        )
    }

    pub(crate) fn drop_unique_constraint(
        &self,
        label: LabelId,
        properties: &[PropertyId],
        desired: Option<u64>,
    ) -> Result<()> {
        let _guard = self.main_lock.write();
        if !self.constraints.unique.drop_constraint(label, properties) {
            return Err(Error::ConstraintDefinition(
                "unique constraint does not exist",
            ));
        }
        self.schema_commit(
            WalRecord::UniqueConstraintDrop {
                label: self.label_name(label),
                properties: properties.iter().map(|p| self.property_name(*p)).collect(),
            },
            desired,
        )
    }
}

/// Creates a point-in-time snapshot through a snapshot-isolation accessor,
/// finalizes the current WAL segment and applies the retention policy.
pub(crate) fn create_snapshot_internal(
    storage: &Arc<StorageInner>,
    periodic: bool,
) -> std::result::Result<(), SnapshotError> {
    if periodic && storage.analytical_accessors.load(Ordering::Acquire) > 0 {
        return Err(SnapshotError::DisabledForAnalyticalPeriodic);
    }
    let accessor = Accessor::new(storage, IsolationLevel::SnapshotIsolation, StorageMode::Transactional);

    let mut contents = SnapshotContents {
        uuid: storage.uuid.read().clone(),
        epoch: storage.epoch_id.read().clone(),
        start_timestamp: accessor.start_timestamp(),
        ..SnapshotContents::default()
    };

    for vertex in accessor.vertices(View::Old) {
        let labels = vertex.labels(View::Old).map_err(Error::from)?;
        let properties = vertex.properties(View::Old).map_err(Error::from)?;
        let out_edges = vertex.out_edges(View::Old, &[]).map_err(Error::from)?;
        contents.vertices.push(SnapshotVertexRec {
            gid: vertex.gid(),
            labels: labels.iter().map(|label| label.as_u32()).collect(),
            properties: properties
                .into_iter()
                .map(|(property, value)| (property.as_u32(), value))
                .collect(),
            out_edges: out_edges
                .iter()
                .map(|edge| {
                    (
                        edge.gid().as_u64(),
                        edge.edge_type().as_u32(),
                        edge.to_gid().as_u64(),
                    )
                })
                .collect(),
        });
        if storage.config.properties_on_edges {
            for edge in &out_edges {
                let edge_properties = edge.properties(View::Old).map_err(Error::from)?;
                contents.edges.push(SnapshotEdgeRec {
                    gid: edge.gid(),
                    edge_type: edge.edge_type().as_u32(),
                    from: edge.from_gid(),
                    to: edge.to_gid(),
                    properties: edge_properties
                        .into_iter()
                        .map(|(property, value)| (property.as_u32(), value))
                        .collect(),
                });
            }
        }
    }

    contents.label_indices = storage
        .indices
        .label
        .list()
        .into_iter()
        .map(|label| label.as_u32())
        .collect();
    contents.label_property_indices = storage
        .indices
        .label_property
        .list()
        .into_iter()
        .map(|(label, property)| (label.as_u32(), property.as_u32()))
        .collect();
    contents.existence_constraints = storage
        .constraints
        .existence
        .list()
        .into_iter()
        .map(|(label, property)| (label.as_u32(), property.as_u32()))
        .collect();
    contents.unique_constraints = storage
        .constraints
        .unique
        .list()
        .into_iter()
        .map(|(label, properties)| {
            (
                label.as_u32(),
                properties.iter().map(|p| p.as_u32()).collect(),
            )
        })
        .collect();
    contents.mapper_names = storage.name_id_mapper.snapshot();

    let snapshot_directory = durability::snapshot_directory(&storage.config.data_directory);
    let path = snapshot::write_snapshot(&snapshot_directory, &contents).map_err(Error::from)?;

    // Rotate the WAL so the snapshot bounds a clean segment.
    if let Some(writer) = storage.wal.lock().take() {
        writer.finalize().map_err(Error::from)?;
    }
    snapshot::apply_retention(&snapshot_directory, storage.config.snapshot_retention_count)
        .map_err(Error::from)?;

    info!(
        path = %path.display(),
        start_timestamp = contents.start_timestamp,
        vertices = contents.vertices.len(),
        edges = contents.edges.len(),
        "storage.snapshot.created"
    );
    Ok(())
}

/// The storage engine: owns the object store, indices, constraints,
/// durability artifacts and background maintenance threads. All data
/// access goes through short-lived [`Accessor`] handles.
pub struct Storage {
    inner: Arc<StorageInner>,
    gc_runner: Option<Scheduler>,
    snapshot_runner: Option<Scheduler>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new(config: Config) -> Result<Self> {
        let needs_directories = config.durability_enabled()
            || config.recover_on_startup
            || config.snapshot_on_exit;
        let lock_file = if needs_directories {
            Some(durability::prepare_directories(&config)?)
        } else {
            None
        };

        let inner = Arc::new(StorageInner::new(config));
        *inner.lock_file.lock() = lock_file;

        if inner.config.recover_on_startup {
            recovery::recover(&inner)?;
        } else if needs_directories {
            durability::move_durable_files_to_backup(&inner.config)?;
        }
        inner.durability_ready.store(true, Ordering::Release);

        let gc_runner = if inner.config.periodic_gc {
            let gc_inner = Arc::clone(&inner);
            Some(Scheduler::run(
                "storage-gc",
                inner.config.gc_interval,
                move || gc::collect_garbage(&gc_inner, false),
            ))
        } else {
            None
        };
        let snapshot_runner = if inner.config.durability_enabled() {
            let snapshot_inner = Arc::clone(&inner);
            Some(Scheduler::run(
                "storage-snapshot",
                inner.config.snapshot_interval,
                move || {
                    if let Err(error) = create_snapshot_internal(&snapshot_inner, true) {
                        warn!(%error, "storage.snapshot.declined");
                    }
                },
            ))
        } else {
            None
        };

        info!(
            data_directory = %inner.config.data_directory.display(),
            durability = ?inner.config.durability_mode,
            uuid = %inner.uuid.read(),
            "storage.started"
        );
        Ok(Self {
            inner,
            gc_runner,
            snapshot_runner,
        })
    }

    /// Starts a transaction and returns its accessor.
    pub fn access(&self, isolation_level: IsolationLevel, storage_mode: StorageMode) -> Accessor {
        Accessor::new(&self.inner, isolation_level, storage_mode)
    }

    // ---- name/id front doors ----------------------------------------

    pub fn label_id(&self, name: &str) -> LabelId {
        LabelId::new(self.inner.name_id_mapper.name_to_id(name))
    }

    pub fn property_id(&self, name: &str) -> PropertyId {
        PropertyId::new(self.inner.name_id_mapper.name_to_id(name))
    }

    pub fn edge_type_id(&self, name: &str) -> EdgeTypeId {
        EdgeTypeId::new(self.inner.name_id_mapper.name_to_id(name))
    }

    pub fn label_name(&self, label: LabelId) -> Option<String> {
        self.inner.name_id_mapper.id_to_name(label.as_u32())
    }

    pub fn property_name(&self, property: PropertyId) -> Option<String> {
        self.inner.name_id_mapper.id_to_name(property.as_u32())
    }

    pub fn edge_type_name(&self, edge_type: EdgeTypeId) -> Option<String> {
        self.inner.name_id_mapper.id_to_name(edge_type.as_u32())
    }

    // ---- schema ------------------------------------------------------

    pub fn create_label_index(&self, label: LabelId) -> Result<()> {
        self.inner.create_label_index(label, None)
    }

    pub fn drop_label_index(&self, label: LabelId) -> Result<()> {
        self.inner.drop_label_index(label, None)
    }

    pub fn create_label_property_index(&self, label: LabelId, property: PropertyId) -> Result<()> {
        self.inner.create_label_property_index(label, property, None)
    }

    pub fn drop_label_property_index(&self, label: LabelId, property: PropertyId) -> Result<()> {
        self.inner.drop_label_property_index(label, property, None)
    }

    pub fn create_existence_constraint(&self, label: LabelId, property: PropertyId) -> Result<()> {
        self.inner.create_existence_constraint(label, property, None)
    }

    pub fn drop_existence_constraint(&self, label: LabelId, property: PropertyId) -> Result<()> {
        self.inner.drop_existence_constraint(label, property, None)
    }

    pub fn create_unique_constraint(
        &self,
        label: LabelId,
        properties: &[PropertyId],
    ) -> Result<()> {
        self.inner.create_unique_constraint(label, properties, None)
    }

    pub fn drop_unique_constraint(&self, label: LabelId, properties: &[PropertyId]) -> Result<()> {
        self.inner.drop_unique_constraint(label, properties, None)
    }

    pub fn label_indices(&self) -> Vec<LabelId> {
        self.inner.indices.label.list()
    }

    pub fn label_property_indices(&self) -> Vec<(LabelId, PropertyId)> {
        self.inner.indices.label_property.list()
    }

    pub fn existence_constraints(&self) -> Vec<(LabelId, PropertyId)> {
        self.inner.constraints.existence.list()
    }

    pub fn unique_constraints(&self) -> Vec<(LabelId, Vec<PropertyId>)> {
        self.inner.constraints.unique.list()
    }

    // ---- maintenance and introspection ------------------------------

    pub fn info(&self) -> StorageInfo {
        let vertex_count = self.inner.vertices.read().len() as u64;
        let edge_count = self.inner.edge_count.load(Ordering::Acquire);
        let average_degree = if vertex_count > 0 {
            2.0 * edge_count as f64 / vertex_count as f64
        } else {
            0.0
        };
        StorageInfo {
            vertex_count,
            edge_count,
            average_degree,
        }
    }

    /// Runs one garbage collection cycle on the calling thread.
    pub fn run_gc(&self) {
        gc::collect_garbage(&self.inner, false);
    }

    pub fn last_gc_stats(&self) -> Option<GcStats> {
        self.inner.last_gc_stats.lock().clone()
    }

    /// Total live entries across the label and label+property indices.
    pub fn index_entry_count(&self) -> usize {
        self.inner.indices.total_entries()
    }

    /// Total live entries across unique-constraint containers.
    pub fn constraint_entry_count(&self) -> usize {
        self.inner.constraints.unique.total_entries()
    }

    pub fn create_snapshot(&self) -> std::result::Result<(), SnapshotError> {
        create_snapshot_internal(&self.inner, false)
    }

    pub fn uuid(&self) -> String {
        self.inner.uuid.read().clone()
    }

    /// Commit timestamp of the newest committed transaction or schema
    /// operation.
    pub fn last_commit_timestamp(&self) -> u64 {
        self.inner.last_commit_timestamp.load(Ordering::Acquire)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(mut runner) = self.gc_runner.take() {
            runner.stop();
        }
        if let Some(mut runner) = self.snapshot_runner.take() {
            runner.stop();
        }
        if self.inner.config.snapshot_on_exit {
            if let Err(error) = create_snapshot_internal(&self.inner, false) {
                warn!(%error, "storage.snapshot.on_exit_failed");
            }
        }
        if let Some(writer) = self.inner.wal.lock().take() {
            if let Err(error) = writer.finalize() {
                warn!(%error, "storage.wal.finalize_failed");
            }
        }
        gc::collect_garbage(&self.inner, true);
        info!("storage.stopped");
    }
}
