use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::ids::Gid;
use crate::storage::delta::{Delta, DeltaOwner};
use crate::storage::edge::Edge;
use crate::storage::vertex::Vertex;
use crate::storage::StorageInner;

/// Outcome of one garbage collection cycle.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub oldest_active: u64,
    pub transactions_unlinked: u64,
    pub arenas_reclaimed: u64,
    pub vertices_removed: u64,
    pub edges_removed: u64,
    pub index_cleanup_run: bool,
    pub forced: bool,
    pub run_millis: u64,
}

/// One garbage collection cycle.
///
/// Phase 1 unlinks delta chains of transactions whose commit timestamp is
/// older than the oldest active start timestamp, so no reader can need
/// them. Phase 2 reclaims arenas and deleted objects whose unlink happened
/// long enough ago that no reader can still hold them. `force` (shutdown)
/// skips the oldest-active fence; it requires the exclusive storage lock
/// and falls back to a regular cycle when accessors are still alive.
pub(crate) fn collect_garbage(storage: &Arc<StorageInner>, force: bool) {
    let _write_guard;
    let _read_guard;
    if force {
        match storage.main_lock.try_write() {
            Some(guard) => {
                _write_guard = Some(guard);
                _read_guard = None;
            }
            None => {
                collect_garbage(storage, false);
                return;
            }
        }
    } else {
        _read_guard = Some(storage.main_lock.read());
        _write_guard = None;
    }

    let Some(_gc_guard) = storage.gc_lock.try_lock() else {
        return;
    };
    let started = Instant::now();

    let oldest_active = if force {
        u64::MAX
    } else {
        storage.commit_log.oldest_active()
    };

    let mut current_deleted_vertices: Vec<Gid> =
        std::mem::take(&mut *storage.deleted_vertices.lock());
    let current_deleted_edges_seed: Vec<Gid> =
        std::mem::take(&mut *storage.deleted_edges.lock());
    let mut current_deleted_edges = current_deleted_edges_seed;

    let tombstone_vertices: Vec<Gid> =
        std::mem::take(&mut *storage.analytical_deleted_vertices.lock());
    let tombstone_edges: Vec<Gid> = std::mem::take(&mut *storage.analytical_deleted_edges.lock());

    // Index cleanup only pays off when something could have become stale
    // since the previous cycle.
    let run_index_cleanup = !storage.committed_transactions.lock().is_empty()
        || !storage.garbage_undo_buffers.lock().is_empty()
        || !tombstone_vertices.is_empty()
        || !tombstone_edges.is_empty();

    // Phase 1: unlink chains of sufficiently old committed transactions,
    // in commit order.
    let mut unlinked_arenas: Vec<Vec<Arc<Delta>>> = Vec::new();
    loop {
        let finished = {
            let mut committed = storage.committed_transactions.lock();
            match committed.front() {
                None => break,
                Some(front) => {
                    let commit_timestamp = front.commit_cell.load(Ordering::Acquire);
                    if commit_timestamp >= oldest_active {
                        break;
                    }
                    committed.pop_front().expect("front exists")
                }
            }
        };
        let commit_timestamp = finished.commit_cell.load(Ordering::Acquire);
        unlink_transaction(
            &finished.deltas,
            commit_timestamp,
            &mut current_deleted_vertices,
            &mut current_deleted_edges,
        );
        unlinked_arenas.push(finished.deltas);
    }
    let transactions_unlinked = unlinked_arenas.len() as u64;

    // Indices are refreshed after unlinking so that no reclaimed vertex is
    // still reachable through an index entry.
    if run_index_cleanup {
        storage.indices.remove_obsolete_entries(oldest_active);
        storage
            .constraints
            .unique
            .remove_obsolete_entries(oldest_active);
    }

    // Mark everything unlinked in this cycle with the current logical time;
    // it becomes reclaimable once that time falls behind oldest-active.
    let mark_timestamp = {
        let _engine = storage.engine_lock.lock();
        storage.timestamp.load(Ordering::Acquire)
    };
    {
        let mut buffers = storage.garbage_undo_buffers.lock();
        for arena in unlinked_arenas {
            buffers.push_back((mark_timestamp, arena));
        }
    }
    {
        let mut garbage = storage.garbage_vertices.lock();
        for gid in current_deleted_vertices {
            garbage.push_back((mark_timestamp, gid));
        }
    }

    // Phase 2: reclaim.
    let mut arenas_reclaimed = 0u64;
    {
        let mut buffers = storage.garbage_undo_buffers.lock();
        if force {
            arenas_reclaimed = buffers.len() as u64;
            buffers.clear();
        } else {
            while let Some((marked_at, _)) = buffers.front() {
                if *marked_at > oldest_active {
                    break;
                }
                buffers.pop_front();
                arenas_reclaimed += 1;
            }
        }
    }

    let mut removable_vertices = Vec::new();
    {
        let mut garbage = storage.garbage_vertices.lock();
        if force {
            removable_vertices.extend(garbage.drain(..).map(|(_, gid)| gid));
        } else {
            while let Some((marked_at, _)) = garbage.front() {
                if *marked_at >= oldest_active {
                    break;
                }
                let (_, gid) = garbage.pop_front().expect("front exists");
                removable_vertices.push(gid);
            }
        }
    }
    let mut vertices_removed = 0u64;
    if !removable_vertices.is_empty() {
        let mut vertices = storage.vertices.write();
        for gid in removable_vertices {
            if vertices.remove(&gid).is_some() {
                vertices_removed += 1;
            }
        }
    }

    let edges_removed = current_deleted_edges.len() as u64;
    if !current_deleted_edges.is_empty() {
        let mut edges = storage.edges.write();
        for gid in &current_deleted_edges {
            edges.remove(gid);
        }
    }

    // Analytical deletions have no delta chains; their tombstones point at
    // exactly the objects to erase.
    let (tombstoned_vertices, tombstoned_edges) =
        reclaim_analytical_tombstones(storage, tombstone_vertices, tombstone_edges);

    let stats = GcStats {
        oldest_active,
        transactions_unlinked,
        arenas_reclaimed,
        vertices_removed: vertices_removed + tombstoned_vertices,
        edges_removed: edges_removed + tombstoned_edges,
        index_cleanup_run: run_index_cleanup,
        forced: force,
        run_millis: started.elapsed().as_millis() as u64,
    };
    let made_progress = stats.transactions_unlinked > 0
        || stats.arenas_reclaimed > 0
        || stats.vertices_removed > 0
        || stats.edges_removed > 0;
    if made_progress {
        info!(
            oldest_active = stats.oldest_active,
            transactions_unlinked = stats.transactions_unlinked,
            arenas_reclaimed = stats.arenas_reclaimed,
            vertices_removed = stats.vertices_removed,
            edges_removed = stats.edges_removed,
            forced = stats.forced,
            run_millis = stats.run_millis,
            "storage.gc.completed"
        );
    } else {
        debug!(
            oldest_active = stats.oldest_active,
            forced = stats.forced,
            "storage.gc.noop"
        );
    }
    *storage.last_gc_stats.lock() = Some(stats);
}

/// Detaches one committed transaction's deltas from their version chains.
/// For every touched object the transaction's deltas form the oldest still
/// linked suffix, so a single cut at the newest of them detaches the whole
/// segment. Deleted objects whose chain becomes empty are queued for
/// physical removal.
fn unlink_transaction(
    deltas: &[Arc<Delta>],
    commit_timestamp: u64,
    deleted_vertices: &mut Vec<Gid>,
    deleted_edges: &mut Vec<Gid>,
) {
    let mut seen_vertices: Vec<Gid> = Vec::new();
    let mut seen_edges: Vec<Gid> = Vec::new();
    for delta in deltas {
        match &delta.owner {
            DeltaOwner::Vertex(weak) => {
                let Some(vertex) = weak.upgrade() else { continue };
                if seen_vertices.contains(&vertex.gid) {
                    continue;
                }
                seen_vertices.push(vertex.gid);
                unlink_vertex_chain(&vertex, commit_timestamp, deleted_vertices);
            }
            DeltaOwner::Edge(weak) => {
                let Some(edge) = weak.upgrade() else { continue };
                if seen_edges.contains(&edge.gid) {
                    continue;
                }
                seen_edges.push(edge.gid);
                unlink_edge_chain(&edge, commit_timestamp, deleted_edges);
            }
        }
    }
}

fn unlink_vertex_chain(vertex: &Vertex, commit_timestamp: u64, deleted_out: &mut Vec<Gid>) {
    let mut payload = vertex.payload.lock();
    if let Some(head) = payload.delta.clone() {
        if head.load_timestamp() == commit_timestamp {
            payload.delta = None;
            if payload.deleted {
                deleted_out.push(vertex.gid);
            }
            return;
        }
    }
    let mut cursor = payload.delta.clone();
    while let Some(current) = cursor {
        let next = current.next.read().clone();
        if let Some(next_delta) = &next {
            if next_delta.load_timestamp() == commit_timestamp {
                *current.next.write() = None;
                return;
            }
        }
        cursor = next;
    }
}

fn unlink_edge_chain(edge: &Edge, commit_timestamp: u64, deleted_out: &mut Vec<Gid>) {
    let mut payload = edge.payload.lock();
    if let Some(head) = payload.delta.clone() {
        if head.load_timestamp() == commit_timestamp {
            payload.delta = None;
            if payload.deleted {
                deleted_out.push(edge.gid);
            }
            return;
        }
    }
    let mut cursor = payload.delta.clone();
    while let Some(current) = cursor {
        let next = current.next.read().clone();
        if let Some(next_delta) = &next {
            if next_delta.load_timestamp() == commit_timestamp {
                *current.next.write() = None;
                return;
            }
        }
        cursor = next;
    }
}

fn reclaim_analytical_tombstones(
    storage: &StorageInner,
    tombstone_vertices: Vec<Gid>,
    tombstone_edges: Vec<Gid>,
) -> (u64, u64) {
    let mut vertices_removed = 0u64;
    for gid in tombstone_vertices {
        let vertex = storage.vertices.read().get(&gid).cloned();
        let Some(vertex) = vertex else { continue };
        let removable = {
            let payload = vertex.payload.lock();
            payload.delta.is_none() && payload.deleted
        };
        if removable && storage.vertices.write().remove(&gid).is_some() {
            vertices_removed += 1;
        }
    }
    let mut edges_removed = 0u64;
    for gid in tombstone_edges {
        let edge = storage.edges.read().get(&gid).cloned();
        let Some(edge) = edge else {
            // Without properties on edges there is no object to erase; the
            // adjacency entries are already gone.
            edges_removed += 1;
            continue;
        };
        let removable = {
            let payload = edge.payload.lock();
            payload.delta.is_none() && payload.deleted
        };
        if removable && storage.edges.write().remove(&gid).is_some() {
            edges_removed += 1;
        }
    }
    (vertices_removed, edges_removed)
}
