use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::ids::{LabelId, PropertyId};
use crate::storage::edge::{Edge, EdgeEntry};
use crate::storage::transaction::Transaction;
use crate::storage::vertex::Vertex;
use crate::value::PropertyValue;

/// Transaction ids live in the upper half of the 64-bit space while
/// timestamps stay below, so a commit-cell value with the high bit set *is*
/// the id of a transaction that has not committed yet.
pub(crate) const TRANSACTION_INITIAL_ID: u64 = 1 << 63;

pub(crate) fn is_transaction_id(timestamp: u64) -> bool {
    timestamp >= TRANSACTION_INITIAL_ID
}

/// The inverse of one mutation. Replaying deltas newer than a view
/// timestamp turns the current object payload back into the version that
/// view is entitled to observe.
#[derive(Debug, Clone)]
pub(crate) enum DeltaAction {
    SetProperty {
        key: PropertyId,
        value: PropertyValue,
    },
    AddLabel(LabelId),
    RemoveLabel(LabelId),
    AddInEdge(EdgeEntry),
    AddOutEdge(EdgeEntry),
    RemoveInEdge(EdgeEntry),
    RemoveOutEdge(EdgeEntry),
    RecreateObject,
    DeleteObject,
    /// Same meaning as `DeleteObject`, but marks an object materialized
    /// from a durable artifact (snapshot/WAL ingest) rather than created by
    /// a regular user transaction.
    DeleteDeserializedObject,
}

/// Backlink from a delta to the object whose version chain holds it. Weak:
/// the object store maps own the objects.
#[derive(Debug, Clone)]
pub(crate) enum DeltaOwner {
    Vertex(Weak<Vertex>),
    Edge(Weak<Edge>),
}

pub(crate) struct Delta {
    pub(crate) action: DeltaAction,
    /// The owning transaction's commit cell: the transaction id until
    /// commit, the commit timestamp afterwards.
    pub(crate) timestamp: Arc<AtomicU64>,
    pub(crate) owner: DeltaOwner,
    /// Next-older delta in the chain. Edited only under the owner's object
    /// lock; readers clone the head under the lock and then walk freely.
    pub(crate) next: RwLock<Option<Arc<Delta>>>,
}

impl Delta {
    pub(crate) fn new(action: DeltaAction, tx: &Transaction, owner: DeltaOwner) -> Arc<Self> {
        Arc::new(Self {
            action,
            timestamp: Arc::clone(&tx.commit_cell),
            owner,
            next: RwLock::new(None),
        })
    }

    pub(crate) fn load_timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Delta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delta")
            .field("action", &self.action)
            .field("timestamp", &self.load_timestamp())
            .finish()
    }
}

/// Checks whether `tx` may legally write an object whose chain head is
/// `head`: the head must belong to the transaction itself or to a
/// transaction that committed before this one started. Anything else is a
/// write-write conflict.
pub(crate) fn prepare_for_write(tx: &Transaction, head: &Option<Arc<Delta>>) -> bool {
    match head {
        None => true,
        Some(delta) => {
            let timestamp = delta.load_timestamp();
            timestamp == tx.id || timestamp < tx.start_timestamp
        }
    }
}

/// Splices `delta` in as the new chain head and records it in the
/// transaction's arena. Must run under the owner's object lock.
pub(crate) fn link_delta(tx: &Transaction, head: &mut Option<Arc<Delta>>, delta: Arc<Delta>) {
    *delta.next.write() = head.take();
    *head = Some(Arc::clone(&delta));
    tx.push_delta(delta);
}

/// Walks a version chain from `head` toward older deltas, applying each
/// delta that is invisible to the caller's view. Stops at the first delta
/// that is visible: the caller's own write (when `include_own`) or a
/// commit older than `view_timestamp`.
pub(crate) fn apply_deltas_for_read<F>(
    head: Option<Arc<Delta>>,
    tx_id: u64,
    view_timestamp: u64,
    include_own: bool,
    mut apply: F,
) where
    F: FnMut(&DeltaAction),
{
    let mut current = head;
    while let Some(delta) = current {
        let timestamp = delta.load_timestamp();
        let visible = if timestamp == tx_id {
            include_own
        } else {
            timestamp < view_timestamp
        };
        if visible {
            break;
        }
        apply(&delta.action);
        current = delta.next.read().clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::transaction::{IsolationLevel, StorageMode, Transaction};

    fn test_tx(id_offset: u64, start_timestamp: u64) -> Transaction {
        Transaction::new(
            TRANSACTION_INITIAL_ID + id_offset,
            start_timestamp,
            IsolationLevel::SnapshotIsolation,
            StorageMode::Transactional,
            None,
        )
    }

    fn vertex_owner() -> DeltaOwner {
        DeltaOwner::Vertex(Weak::new())
    }

    #[test]
    fn sentinel_bit_distinguishes_tx_ids() {
        assert!(is_transaction_id(TRANSACTION_INITIAL_ID));
        assert!(!is_transaction_id(0));
        assert!(!is_transaction_id(TRANSACTION_INITIAL_ID - 1));
    }

    #[test]
    fn prepare_for_write_rules() {
        let writer = test_tx(1, 10);
        let mut head = None;
        assert!(prepare_for_write(&writer, &head));

        let delta = Delta::new(DeltaAction::DeleteObject, &writer, vertex_owner());
        link_delta(&writer, &mut head, delta);

        // Same transaction may keep writing.
        assert!(prepare_for_write(&writer, &head));
        // A concurrent transaction that started before the write is a conflict.
        let other = test_tx(2, 10);
        assert!(!prepare_for_write(&other, &head));

        // Once committed before another transaction's start, writes are legal.
        writer.commit_cell.store(5, Ordering::Release);
        let late = test_tx(3, 10);
        assert!(prepare_for_write(&late, &head));
        let early = test_tx(4, 3);
        assert!(!prepare_for_write(&early, &head));
    }

    #[test]
    fn read_walk_stops_at_visible_delta() {
        let committed = test_tx(1, 0);
        let mut head = None;
        link_delta(
            &committed,
            &mut head,
            Delta::new(DeltaAction::AddLabel(crate::ids::LabelId::new(1)), &committed, vertex_owner()),
        );
        committed.commit_cell.store(4, Ordering::Release);

        let uncommitted = test_tx(2, 5);
        link_delta(
            &uncommitted,
            &mut head,
            Delta::new(DeltaAction::AddLabel(crate::ids::LabelId::new(2)), &uncommitted, vertex_owner()),
        );

        // A reader at view 5 undoes the uncommitted write but keeps the
        // commit from timestamp 4.
        let mut applied = Vec::new();
        apply_deltas_for_read(head.clone(), TRANSACTION_INITIAL_ID + 9, 5, true, |action| {
            if let DeltaAction::AddLabel(label) = action {
                applied.push(*label);
            }
        });
        assert_eq!(applied, vec![crate::ids::LabelId::new(2)]);

        // The writer itself sees its own chain head.
        let mut own = Vec::new();
        apply_deltas_for_read(head, uncommitted.id, 5, true, |action| {
            if let DeltaAction::AddLabel(label) = action {
                own.push(*label);
            }
        });
        assert!(own.is_empty());
    }
}
