use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::ids::Gid;
use crate::storage::delta::Delta;
use crate::storage::edge::EdgeEntry;

/// How reads inside a transaction pick their view timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Every read observes the state as of the transaction's start.
    SnapshotIsolation,
    /// Every read observes the latest committed state at the time of the read.
    ReadCommitted,
    /// Reads observe uncommitted writes of concurrent transactions.
    ReadUncommitted,
}

/// Whether operations go through MVCC deltas or mutate objects directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Transactional,
    /// No deltas, no conflict detection, immediate visibility. Deletions
    /// record tombstones consumed by the garbage collector.
    Analytical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EdgeDirection {
    In,
    Out,
}

/// Per-transaction cache of reconstructed adjacency lists, keyed by
/// (vertex, direction, view). Repeated neighborhood reads over long delta
/// chains hit the cache instead of replaying the chain every time; any
/// write touching a vertex drops its entries.
#[derive(Default)]
pub(crate) struct DeltaCache {
    edges: FxHashMap<(Gid, EdgeDirection, u64, bool), Arc<Vec<EdgeEntry>>>,
}

impl DeltaCache {
    pub(crate) fn get(
        &self,
        gid: Gid,
        direction: EdgeDirection,
        view_timestamp: u64,
        include_own: bool,
    ) -> Option<Arc<Vec<EdgeEntry>>> {
        self.edges
            .get(&(gid, direction, view_timestamp, include_own))
            .cloned()
    }

    pub(crate) fn insert(
        &mut self,
        gid: Gid,
        direction: EdgeDirection,
        view_timestamp: u64,
        include_own: bool,
        entries: Arc<Vec<EdgeEntry>>,
    ) {
        self.edges
            .insert((gid, direction, view_timestamp, include_own), entries);
    }

    pub(crate) fn invalidate(&mut self, gid: Gid) {
        self.edges.retain(|key, _| key.0 != gid);
    }
}

/// State of one open transaction.
pub(crate) struct Transaction {
    pub(crate) id: u64,
    pub(crate) start_timestamp: u64,
    /// Shared with every delta the transaction creates; holds the
    /// transaction id until commit publishes the commit timestamp here.
    pub(crate) commit_cell: Arc<AtomicU64>,
    pub(crate) isolation_level: IsolationLevel,
    pub(crate) storage_mode: StorageMode,
    pub(crate) must_abort: AtomicBool,
    pub(crate) deadline: Option<Instant>,
    deltas: Mutex<Vec<Arc<Delta>>>,
    cache: Mutex<DeltaCache>,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        start_timestamp: u64,
        isolation_level: IsolationLevel,
        storage_mode: StorageMode,
        deadline: Option<Instant>,
    ) -> Self {
        debug_assert!(crate::storage::delta::is_transaction_id(id));
        Self {
            id,
            start_timestamp,
            commit_cell: Arc::new(AtomicU64::new(id)),
            isolation_level,
            storage_mode,
            must_abort: AtomicBool::new(false),
            deadline,
            deltas: Mutex::new(Vec::new()),
            cache: Mutex::new(DeltaCache::default()),
        }
    }

    pub(crate) fn push_delta(&self, delta: Arc<Delta>) {
        self.deltas.lock().push(delta);
    }

    pub(crate) fn has_deltas(&self) -> bool {
        !self.deltas.lock().is_empty()
    }

    /// Deltas in insertion order. Snapshot of the arena; the transaction is
    /// the only writer so the copy is exact during commit/abort.
    pub(crate) fn deltas(&self) -> Vec<Arc<Delta>> {
        self.deltas.lock().clone()
    }

    pub(crate) fn take_deltas(&self) -> Vec<Arc<Delta>> {
        std::mem::take(&mut *self.deltas.lock())
    }

    pub(crate) fn cached_edges(
        &self,
        gid: Gid,
        direction: EdgeDirection,
        view_timestamp: u64,
        include_own: bool,
    ) -> Option<Arc<Vec<EdgeEntry>>> {
        self.cache
            .lock()
            .get(gid, direction, view_timestamp, include_own)
    }

    pub(crate) fn cache_edges(
        &self,
        gid: Gid,
        direction: EdgeDirection,
        view_timestamp: u64,
        include_own: bool,
        entries: Arc<Vec<EdgeEntry>>,
    ) {
        self.cache
            .lock()
            .insert(gid, direction, view_timestamp, include_own, entries);
    }

    pub(crate) fn invalidate_cache(&self, gid: Gid) {
        self.cache.lock().invalidate(gid);
    }

    /// Cooperative cancellation check, called at operation granularity.
    pub(crate) fn check_cancellation(&self) -> Result<()> {
        if self.must_abort.load(Ordering::Acquire) {
            return Err(Error::TransactionTerminated);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.must_abort.store(true, Ordering::Release);
                return Err(Error::TransactionTimeout);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::delta::TRANSACTION_INITIAL_ID;
    use std::time::Duration;

    #[test]
    fn cancellation_flags() {
        let tx = Transaction::new(
            TRANSACTION_INITIAL_ID,
            1,
            IsolationLevel::SnapshotIsolation,
            StorageMode::Transactional,
            None,
        );
        assert!(tx.check_cancellation().is_ok());
        tx.must_abort.store(true, Ordering::Release);
        assert!(matches!(
            tx.check_cancellation(),
            Err(Error::TransactionTerminated)
        ));
    }

    #[test]
    fn deadline_arms_must_abort() {
        let tx = Transaction::new(
            TRANSACTION_INITIAL_ID,
            1,
            IsolationLevel::SnapshotIsolation,
            StorageMode::Transactional,
            Some(Instant::now() - Duration::from_millis(1)),
        );
        assert!(matches!(
            tx.check_cancellation(),
            Err(Error::TransactionTimeout)
        ));
        assert!(tx.must_abort.load(Ordering::Acquire));
    }

    #[test]
    fn delta_cache_invalidation_is_per_vertex() {
        let tx = Transaction::new(
            TRANSACTION_INITIAL_ID,
            1,
            IsolationLevel::SnapshotIsolation,
            StorageMode::Transactional,
            None,
        );
        let a = Gid::from_u64(1);
        let b = Gid::from_u64(2);
        tx.cache_edges(a, EdgeDirection::Out, 5, true, Arc::new(Vec::new()));
        tx.cache_edges(b, EdgeDirection::In, 5, true, Arc::new(Vec::new()));
        tx.invalidate_cache(a);
        assert!(tx.cached_edges(a, EdgeDirection::Out, 5, true).is_none());
        assert!(tx.cached_edges(b, EdgeDirection::In, 5, true).is_some());
    }
}
