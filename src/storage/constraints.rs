use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{ConstraintViolation, ConstraintViolationKind, Error, Result};
use crate::ids::{Gid, LabelId, PropertyId};
use crate::storage::delta::{apply_deltas_for_read, DeltaAction};
use crate::storage::transaction::Transaction;
use crate::storage::vertex::{Vertex, VertexPayload};
use crate::value::PropertyValue;

const UNIQUE_CONSTRAINT_MAX_PROPERTIES: usize = 32;

#[derive(Default)]
pub(crate) struct Constraints {
    pub(crate) existence: ExistenceConstraints,
    pub(crate) unique: UniqueConstraints,
}

/// (label, property) pairs that every matching vertex must carry with a
/// non-null value. Enforced during the first commit validation phase.
#[derive(Default)]
pub(crate) struct ExistenceConstraints {
    constraints: RwLock<Vec<(LabelId, PropertyId)>>,
}

impl ExistenceConstraints {
    /// Returns false when the constraint already exists; fails with a
    /// violation when a current vertex breaks it.
    pub(crate) fn create(
        &self,
        label: LabelId,
        property: PropertyId,
        vertices: &[Arc<Vertex>],
    ) -> Result<bool> {
        let mut constraints = self.constraints.write();
        if constraints.contains(&(label, property)) {
            return Ok(false);
        }
        for vertex in vertices {
            let payload = vertex.payload.lock();
            if payload.deleted || !payload.labels.contains(&label) {
                continue;
            }
            if !payload.properties.contains_key(&property) {
                return Err(Error::ConstraintViolation(ConstraintViolation {
                    kind: ConstraintViolationKind::Existence,
                    label,
                    properties: vec![property],
                }));
            }
        }
        constraints.push((label, property));
        Ok(true)
    }

    pub(crate) fn drop_constraint(&self, label: LabelId, property: PropertyId) -> bool {
        let mut constraints = self.constraints.write();
        let before = constraints.len();
        constraints.retain(|pair| *pair != (label, property));
        constraints.len() != before
    }

    pub(crate) fn list(&self) -> Vec<(LabelId, PropertyId)> {
        let mut pairs = self.constraints.read().clone();
        pairs.sort();
        pairs
    }

    /// Validates the current (about-to-commit) state of one vertex.
    pub(crate) fn validate_payload(&self, payload: &VertexPayload) -> Option<ConstraintViolation> {
        if payload.deleted {
            return None;
        }
        for (label, property) in self.constraints.read().iter() {
            if payload.labels.contains(label) && !payload.properties.contains_key(property) {
                return Some(ConstraintViolation {
                    kind: ConstraintViolationKind::Existence,
                    label: *label,
                    properties: vec![*property],
                });
            }
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.constraints.read().is_empty()
    }
}

type UniqueKey = (Vec<PropertyValue>, Gid, u64);
type Entries = RwLock<BTreeMap<UniqueKey, Arc<Vertex>>>;

/// Uniqueness over (label, ordered property set). One ordered container per
/// constraint keyed by the property-value tuple; validation happens at
/// commit under the engine lock against the last committed version of every
/// colliding entry.
#[derive(Default)]
pub(crate) struct UniqueConstraints {
    constraints: RwLock<FxHashMap<(LabelId, Vec<PropertyId>), Arc<Entries>>>,
}

fn canonical_properties(properties: &[PropertyId]) -> Vec<PropertyId> {
    let mut sorted = properties.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

fn extract_values(
    payload: &VertexPayload,
    properties: &[PropertyId],
) -> Option<Vec<PropertyValue>> {
    let mut values = Vec::with_capacity(properties.len());
    for property in properties {
        values.push(payload.properties.get(property)?.clone());
    }
    Some(values)
}

impl UniqueConstraints {
    /// Registers the constraint and seeds it from the current vertex set.
    /// The caller must hold the storage main lock exclusively so the scan
    /// sees a stable vertex set.
    pub(crate) fn create(
        &self,
        label: LabelId,
        properties: &[PropertyId],
        vertices: &[Arc<Vertex>],
    ) -> Result<bool> {
        let properties = canonical_properties(properties);
        if properties.is_empty() {
            return Err(Error::ConstraintDefinition(
                "unique constraint needs at least one property",
            ));
        }
        if properties.len() > UNIQUE_CONSTRAINT_MAX_PROPERTIES {
            return Err(Error::ConstraintDefinition(
                "unique constraint property set too large",
            ));
        }
        let mut constraints = self.constraints.write();
        if constraints.contains_key(&(label, properties.clone())) {
            return Ok(false);
        }
        let entries: Arc<Entries> = Arc::new(RwLock::new(BTreeMap::new()));
        {
            let mut guard = entries.write();
            for vertex in vertices {
                let payload = vertex.payload.lock();
                if payload.deleted || !payload.labels.contains(&label) {
                    continue;
                }
                let Some(values) = extract_values(&payload, &properties) else {
                    continue;
                };
                let collision = guard
                    .range((values.clone(), Gid::ZERO, 0)..=(values.clone(), Gid::MAX, u64::MAX))
                    .next()
                    .is_some();
                if collision {
                    return Err(Error::ConstraintViolation(ConstraintViolation {
                        kind: ConstraintViolationKind::Unique,
                        label,
                        properties,
                    }));
                }
                guard.insert((values, vertex.gid, 0), Arc::clone(vertex));
            }
        }
        constraints.insert((label, properties), entries);
        Ok(true)
    }

    pub(crate) fn drop_constraint(&self, label: LabelId, properties: &[PropertyId]) -> bool {
        let properties = canonical_properties(properties);
        self.constraints
            .write()
            .remove(&(label, properties))
            .is_some()
    }

    pub(crate) fn list(&self) -> Vec<(LabelId, Vec<PropertyId>)> {
        let mut out: Vec<_> = self.constraints.read().keys().cloned().collect();
        out.sort();
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.constraints.read().is_empty()
    }

    /// Pre-registers the vertex in every constraint container it matches,
    /// so concurrent committers see each other during validation. Runs
    /// under the engine lock right before validation.
    pub(crate) fn update_before_commit(&self, vertex: &Arc<Vertex>, start_timestamp: u64) {
        let payload = vertex.payload.lock();
        for ((label, properties), entries) in self.constraints.read().iter() {
            if !payload.labels.contains(label) {
                continue;
            }
            let Some(values) = extract_values(&payload, properties) else {
                continue;
            };
            entries
                .write()
                .insert((values, vertex.gid, start_timestamp), Arc::clone(vertex));
        }
    }

    /// Validates one transaction-modified vertex at its commit timestamp.
    /// A violation exists when some *other* vertex's last committed version
    /// carries the same label and value tuple at `commit_timestamp`.
    pub(crate) fn validate(
        &self,
        vertex: &Arc<Vertex>,
        tx: &Transaction,
        commit_timestamp: u64,
    ) -> Option<ConstraintViolation> {
        let matched_constraints = {
            let payload = vertex.payload.lock();
            if payload.deleted {
                return None;
            }
            let mut extracted = Vec::new();
            for ((label, properties), entries) in self.constraints.read().iter() {
                if !payload.labels.contains(label) {
                    continue;
                }
                if let Some(values) = extract_values(&payload, properties) {
                    extracted.push((*label, properties.clone(), Arc::clone(entries), values));
                }
            }
            extracted
        };

        for (label, properties, entries, values) in matched_constraints {
            let candidates: Vec<Arc<Vertex>> = entries
                .read()
                .range((values.clone(), Gid::ZERO, 0)..=(values.clone(), Gid::MAX, u64::MAX))
                .map(|(_, candidate)| Arc::clone(candidate))
                .collect();
            for candidate in candidates {
                if candidate.gid == vertex.gid {
                    continue;
                }
                if last_committed_version_has_label_properties(
                    &candidate,
                    label,
                    &properties,
                    &values,
                    tx,
                    commit_timestamp,
                ) {
                    return Some(ConstraintViolation {
                        kind: ConstraintViolationKind::Unique,
                        label,
                        properties,
                    });
                }
            }
        }
        None
    }

    pub(crate) fn remove_obsolete_entries(&self, oldest_active: u64) {
        let constraints: Vec<((LabelId, Vec<PropertyId>), Arc<Entries>)> = self
            .constraints
            .read()
            .iter()
            .map(|(key, entries)| (key.clone(), Arc::clone(entries)))
            .collect();
        for ((label, properties), entries) in constraints {
            // Snapshot first; candidate evaluation takes object locks and
            // must not run under the container lock.
            let snapshot: Vec<(UniqueKey, Arc<Vertex>)> = entries
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
                    || !any_version_has_label_properties(
                        vertex,
                        label,
                        &properties,
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
        self.constraints
            .read()
            .values()
            .map(|entries| entries.read().len())
            .sum()
    }
}

/// Whether the candidate's newest version visible at `commit_timestamp`
/// (ignoring the committing transaction's own writes) carries the label and
/// exactly these property values.
fn last_committed_version_has_label_properties(
    vertex: &Vertex,
    label: LabelId,
    properties: &[PropertyId],
    values: &[PropertyValue],
    tx: &Transaction,
    commit_timestamp: u64,
) -> bool {
    debug_assert_eq!(properties.len(), values.len());
    let (mut has_label, mut deleted, mut equal, head) = {
        let payload = vertex.payload.lock();
        let equal: Vec<bool> = properties
            .iter()
            .zip(values)
            .map(|(property, value)| payload.properties.get(property) == Some(value))
            .collect();
        (
            payload.labels.contains(&label),
            payload.deleted,
            equal,
            payload.delta.clone(),
        )
    };

    apply_deltas_for_read(head, tx.id, commit_timestamp, true, |action| match action {
        DeltaAction::SetProperty { key, value } => {
            if let Ok(position) = properties.binary_search(key) {
                equal[position] = value == &values[position];
            }
        }
        DeltaAction::AddLabel(l) if *l == label => has_label = true,
        DeltaAction::RemoveLabel(l) if *l == label => has_label = false,
        DeltaAction::RecreateObject => deleted = false,
        DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => deleted = true,
        _ => {}
    });

    !deleted && has_label && equal.iter().all(|matches| *matches)
}

/// Whether any version reachable by a reader at `oldest_active` or newer
/// carries the label and exactly these property values.
fn any_version_has_label_properties(
    vertex: &Vertex,
    label: LabelId,
    properties: &[PropertyId],
    values: &[PropertyValue],
    oldest_active: u64,
) -> bool {
    let (mut has_label, mut deleted, mut equal, head) = {
        let payload = vertex.payload.lock();
        let equal: Vec<bool> = properties
            .iter()
            .zip(values)
            .map(|(property, value)| payload.properties.get(property) == Some(value))
            .collect();
        (
            payload.labels.contains(&label),
            payload.deleted,
            equal,
            payload.delta.clone(),
        )
    };
    if has_label && !deleted && equal.iter().all(|matches| *matches) {
        return true;
    }
    let mut satisfied = false;
    apply_deltas_for_read(head, 0, oldest_active, false, |action| {
        match action {
            DeltaAction::SetProperty { key, value } => {
                if let Ok(position) = properties.binary_search(key) {
                    equal[position] = value == &values[position];
                }
            }
            DeltaAction::AddLabel(l) if *l == label => has_label = true,
            DeltaAction::RemoveLabel(l) if *l == label => has_label = false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => deleted = true,
            _ => {}
        }
        if has_label && !deleted && equal.iter().all(|matches| *matches) {
            satisfied = true;
        }
    });
    satisfied
}
