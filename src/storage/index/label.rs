use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ids::{Gid, LabelId};
use crate::storage::delta::{apply_deltas_for_read, DeltaAction};
use crate::storage::vertex::Vertex;

type Entries = RwLock<BTreeMap<(Gid, u64), Arc<Vertex>>>;

/// One ordered container per indexed label, entries keyed by
/// (vertex gid, inserting transaction's start timestamp). Entries are only
/// ever added on the write path; obsolete ones are swept by GC.
#[derive(Default)]
pub(crate) struct LabelIndex {
    indices: RwLock<FxHashMap<LabelId, Arc<Entries>>>,
}

impl LabelIndex {
    /// Registers the index and seeds it from the current vertex set.
    /// Returns false if the index already exists.
    pub(crate) fn create(&self, label: LabelId, vertices: &[Arc<Vertex>]) -> bool {
        let mut indices = self.indices.write();
        if indices.contains_key(&label) {
            return false;
        }
        let entries: Arc<Entries> = Arc::new(RwLock::new(BTreeMap::new()));
        {
            let mut guard = entries.write();
            for vertex in vertices {
                let payload = vertex.payload.lock();
                if !payload.deleted && payload.labels.contains(&label) {
                    guard.insert((vertex.gid, 0), Arc::clone(vertex));
                }
            }
        }
        indices.insert(label, entries);
        true
    }

    pub(crate) fn drop_index(&self, label: LabelId) -> bool {
        self.indices.write().remove(&label).is_some()
    }

    pub(crate) fn is_indexed(&self, label: LabelId) -> bool {
        self.indices.read().contains_key(&label)
    }

    pub(crate) fn list(&self) -> Vec<LabelId> {
        let mut labels: Vec<_> = self.indices.read().keys().copied().collect();
        labels.sort();
        labels
    }

    /// Called while the writer holds the vertex lock and has the label set.
    pub(crate) fn update_on_add_label(
        &self,
        label: LabelId,
        vertex: &Arc<Vertex>,
        start_timestamp: u64,
    ) {
        let Some(entries) = self.indices.read().get(&label).cloned() else {
            return;
        };
        entries
            .write()
            .insert((vertex.gid, start_timestamp), Arc::clone(vertex));
    }

    /// Candidate vertices for a label scan, deduplicated by gid. Callers
    /// re-check the label at their view timestamp.
    pub(crate) fn candidates(&self, label: LabelId) -> Option<Vec<Arc<Vertex>>> {
        let entries = self.indices.read().get(&label).cloned()?;
        let guard = entries.read();
        let mut out: Vec<Arc<Vertex>> = Vec::with_capacity(guard.len());
        let mut last: Option<Gid> = None;
        for ((gid, _), vertex) in guard.iter() {
            if last != Some(*gid) {
                out.push(Arc::clone(vertex));
                last = Some(*gid);
            }
        }
        Some(out)
    }

    /// Drops entries older than `oldest_active` that are either duplicated
    /// by a newer entry for the same vertex or no longer satisfied by any
    /// reachable version.
    pub(crate) fn remove_obsolete_entries(&self, oldest_active: u64) {
        let indices: Vec<(LabelId, Arc<Entries>)> = self
            .indices
            .read()
            .iter()
            .map(|(label, entries)| (*label, Arc::clone(entries)))
            .collect();
        for (label, entries) in indices {
            // Snapshot first: evaluating a candidate takes its object lock,
            // which must never happen while the container lock is held
            // (writers lock object then container).
            let snapshot: Vec<((Gid, u64), Arc<Vertex>)> = entries
                .read()
                .iter()
                .map(|(key, vertex)| (*key, Arc::clone(vertex)))
                .collect();
            let mut remove = Vec::new();
            for (position, (key, vertex)) in snapshot.iter().enumerate() {
                if key.1 >= oldest_active {
                    continue;
                }
                let duplicate = snapshot
                    .get(position + 1)
                    .map(|(next, _)| next.0 == key.0)
                    .unwrap_or(false);
                if duplicate || !any_version_has_label(vertex, label, oldest_active) {
                    remove.push(*key);
                }
            }
            if !remove.is_empty() {
                let mut guard = entries.write();
                for key in remove {
                    guard.remove(&key);
                }
            }
        }
    }

    pub(crate) fn total_entries(&self) -> usize {
        self.indices
            .read()
            .values()
            .map(|entries| entries.read().len())
            .sum()
    }
}

/// True when some version of the vertex reachable by a reader at
/// `oldest_active` or newer carries the label.
fn any_version_has_label(vertex: &Vertex, label: LabelId, oldest_active: u64) -> bool {
    let (mut has_label, mut deleted, head) = {
        let payload = vertex.payload.lock();
        (
            payload.labels.contains(&label),
            payload.deleted,
            payload.delta.clone(),
        )
    };
    if has_label && !deleted {
        return true;
    }
    let mut satisfied = false;
    apply_deltas_for_read(head, 0, oldest_active, false, |action| {
        match action {
            DeltaAction::AddLabel(l) if *l == label => has_label = true,
            DeltaAction::RemoveLabel(l) if *l == label => has_label = false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => deleted = true,
            _ => {}
        }
        if has_label && !deleted {
            satisfied = true;
        }
    });
    satisfied
}
