use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ids::{Gid, LabelId, PropertyId};
use crate::storage::delta::{apply_deltas_for_read, DeltaAction};
use crate::storage::vertex::{Vertex, VertexPayload};
use crate::value::PropertyValue;

type Key = (PropertyValue, Gid, u64);
type Entries = RwLock<BTreeMap<Key, Arc<Vertex>>>;

/// One ordered container per (label, property) pair, keyed by
/// (property value, vertex gid, inserting start timestamp). Supports point
/// lookups and bounded ranges over the value order defined by
/// [`PropertyValue`].
#[derive(Default)]
pub(crate) struct LabelPropertyIndex {
    indices: RwLock<FxHashMap<(LabelId, PropertyId), Arc<Entries>>>,
}

impl LabelPropertyIndex {
    pub(crate) fn create(
        &self,
        label: LabelId,
        property: PropertyId,
        vertices: &[Arc<Vertex>],
    ) -> bool {
        let mut indices = self.indices.write();
        if indices.contains_key(&(label, property)) {
            return false;
        }
        let entries: Arc<Entries> = Arc::new(RwLock::new(BTreeMap::new()));
        {
            let mut guard = entries.write();
            for vertex in vertices {
                let payload = vertex.payload.lock();
                if payload.deleted || !payload.labels.contains(&label) {
                    continue;
                }
                if let Some(value) = payload.properties.get(&property) {
                    guard.insert((value.clone(), vertex.gid, 0), Arc::clone(vertex));
                }
            }
        }
        indices.insert((label, property), entries);
        true
    }

    pub(crate) fn drop_index(&self, label: LabelId, property: PropertyId) -> bool {
        self.indices.write().remove(&(label, property)).is_some()
    }

    pub(crate) fn is_indexed(&self, label: LabelId, property: PropertyId) -> bool {
        self.indices.read().contains_key(&(label, property))
    }

    pub(crate) fn list(&self) -> Vec<(LabelId, PropertyId)> {
        let mut pairs: Vec<_> = self.indices.read().keys().copied().collect();
        pairs.sort();
        pairs
    }

    /// Called under the vertex lock after a label was added; indexes every
    /// (label, property) pair the vertex now satisfies.
    pub(crate) fn update_on_add_label(
        &self,
        label: LabelId,
        vertex: &Arc<Vertex>,
        payload: &VertexPayload,
        start_timestamp: u64,
    ) {
        let matching: Vec<(PropertyId, Arc<Entries>)> = self
            .indices
            .read()
            .iter()
            .filter(|((l, _), _)| *l == label)
            .map(|((_, p), entries)| (*p, Arc::clone(entries)))
            .collect();
        for (property, entries) in matching {
            if let Some(value) = payload.properties.get(&property) {
                entries
                    .write()
                    .insert((value.clone(), vertex.gid, start_timestamp), Arc::clone(vertex));
            }
        }
    }

    /// Called under the vertex lock after a property was set to a non-null
    /// value.
    pub(crate) fn update_on_set_property(
        &self,
        property: PropertyId,
        value: &PropertyValue,
        vertex: &Arc<Vertex>,
        payload: &VertexPayload,
        start_timestamp: u64,
    ) {
        let matching: Vec<Arc<Entries>> = self
            .indices
            .read()
            .iter()
            .filter(|((l, p), _)| *p == property && payload.labels.contains(l))
            .map(|(_, entries)| Arc::clone(entries))
            .collect();
        for entries in matching {
            entries
                .write()
                .insert((value.clone(), vertex.gid, start_timestamp), Arc::clone(vertex));
        }
    }

    /// Candidates whose indexed value equals `value`, deduplicated by gid.
    pub(crate) fn candidates_for_value(
        &self,
        label: LabelId,
        property: PropertyId,
        value: &PropertyValue,
    ) -> Option<Vec<Arc<Vertex>>> {
        self.candidates_for_range(
            label,
            property,
            Bound::Included(value.clone()),
            Bound::Included(value.clone()),
        )
    }

    /// Candidates inside the value range, deduplicated by gid.
    pub(crate) fn candidates_for_range(
        &self,
        label: LabelId,
        property: PropertyId,
        lower: Bound<PropertyValue>,
        upper: Bound<PropertyValue>,
    ) -> Option<Vec<Arc<Vertex>>> {
        let entries = self.indices.read().get(&(label, property)).cloned()?;
        let lower = match lower {
            Bound::Included(value) => Bound::Included((value, Gid::ZERO, 0)),
            Bound::Excluded(value) => Bound::Excluded((value, Gid::MAX, u64::MAX)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match upper {
            Bound::Included(value) => Bound::Included((value, Gid::MAX, u64::MAX)),
            Bound::Excluded(value) => Bound::Excluded((value, Gid::ZERO, 0)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let guard = entries.read();
        let mut out = Vec::new();
        let mut seen_last: Option<Gid> = None;
        for ((_, gid, _), vertex) in guard.range((lower, upper)) {
            if seen_last != Some(*gid) {
                out.push(Arc::clone(vertex));
                seen_last = Some(*gid);
            }
        }
        // Entries for one vertex may be scattered across different values,
        // so the same gid can reappear after others; deduplicate fully.
        out.sort_by_key(|vertex| vertex.gid);
        out.dedup_by_key(|vertex| vertex.gid);
        Some(out)
    }

    pub(crate) fn remove_obsolete_entries(&self, oldest_active: u64) {
        let indices: Vec<((LabelId, PropertyId), Arc<Entries>)> = self
            .indices
            .read()
            .iter()
            .map(|(pair, entries)| (*pair, Arc::clone(entries)))
            .collect();
        for ((label, property), entries) in indices {
            // Snapshot first; candidate evaluation takes object locks and
            // must not run under the container lock.
            let snapshot: Vec<(Key, Arc<Vertex>)> = entries
                .read()
                .iter()
                .map(|(key, vertex)| (key.clone(), Arc::clone(vertex)))
                .collect();
            let mut remove = Vec::new();
            for (position, (key, vertex)) in snapshot.iter().enumerate() {
                if key.2 >= oldest_active {
                    continue;
                }
                let duplicate = snapshot
                    .get(position + 1)
                    .map(|(next, _)| next.0 == key.0 && next.1 == key.1)
                    .unwrap_or(false);
                if duplicate
                    || !any_version_has_label_property(
                        vertex,
                        label,
                        property,
                        &key.0,
                        oldest_active,
                    )
                {
                    remove.push(key.clone());
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
/// `oldest_active` or newer carries the label and holds `value` for the
/// property.
fn any_version_has_label_property(
    vertex: &Vertex,
    label: LabelId,
    property: PropertyId,
    value: &PropertyValue,
    oldest_active: u64,
) -> bool {
    let (mut has_label, mut value_matches, mut deleted, head) = {
        let payload = vertex.payload.lock();
        (
            payload.labels.contains(&label),
            payload.properties.get(&property) == Some(value),
            payload.deleted,
            payload.delta.clone(),
        )
    };
    if has_label && value_matches && !deleted {
        return true;
    }
    let mut satisfied = false;
    apply_deltas_for_read(head, 0, oldest_active, false, |action| {
        match action {
            DeltaAction::AddLabel(l) if *l == label => has_label = true,
            DeltaAction::RemoveLabel(l) if *l == label => has_label = false,
            DeltaAction::SetProperty { key, value: old } if *key == property => {
                value_matches = old == value;
            }
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => deleted = true,
            _ => {}
        }
        if has_label && value_matches && !deleted {
            satisfied = true;
        }
    });
    satisfied
}
