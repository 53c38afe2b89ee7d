use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ids::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::storage::accessor::{Accessor, EdgeRef};
use crate::storage::delta::{
    apply_deltas_for_read, link_delta, prepare_for_write, Delta, DeltaAction, DeltaOwner,
};
use crate::storage::edge::EdgeEntry;
use crate::storage::transaction::{EdgeDirection, StorageMode};
use crate::storage::vertex::Vertex;
use crate::storage::View;
use crate::value::PropertyValue;

/// Handle to one vertex inside an open transaction. Reads take a [`View`]
/// and reconstruct the version that view is entitled to observe; writes
/// conflict-check against concurrent transactions.
pub struct VertexRef<'a> {
    pub(crate) vertex: Arc<Vertex>,
    pub(crate) accessor: &'a Accessor,
}

impl<'a> VertexRef<'a> {
    pub(crate) fn new(vertex: Arc<Vertex>, accessor: &'a Accessor) -> Self {
        Self { vertex, accessor }
    }

    pub fn gid(&self) -> Gid {
        self.vertex.gid
    }

    fn transactional(&self) -> bool {
        self.accessor.transaction.storage_mode == StorageMode::Transactional
    }

    // ---- writes ------------------------------------------------------

    /// Adds a label. Returns false when the label was already present.
    pub fn add_label(&self, label: LabelId) -> Result<bool> {
        let tx = &self.accessor.transaction;
        tx.check_cancellation()?;
        let storage = &self.accessor.storage;
        let mut payload = self.vertex.payload.lock();
        if self.transactional() && !prepare_for_write(tx, &payload.delta) {
            return Err(Error::Serialization);
        }
        if payload.deleted {
            return Err(Error::DeletedObject);
        }
        if payload.labels.contains(&label) {
            return Ok(false);
        }
        if self.transactional() {
            let delta = Delta::new(
                DeltaAction::RemoveLabel(label),
                tx,
                DeltaOwner::Vertex(Arc::downgrade(&self.vertex)),
            );
            link_delta(tx, &mut payload.delta, delta);
        }
        payload.labels.push(label);
        storage
            .indices
            .update_on_add_label(label, &self.vertex, &payload, tx.start_timestamp);
        Ok(true)
    }

    /// Removes a label. Returns false when the label was not present.
    pub fn remove_label(&self, label: LabelId) -> Result<bool> {
        let tx = &self.accessor.transaction;
        tx.check_cancellation()?;
        let mut payload = self.vertex.payload.lock();
        if self.transactional() && !prepare_for_write(tx, &payload.delta) {
            return Err(Error::Serialization);
        }
        if payload.deleted {
            return Err(Error::DeletedObject);
        }
        let Some(position) = payload.labels.iter().position(|existing| *existing == label) else {
            return Ok(false);
        };
        if self.transactional() {
            let delta = Delta::new(
                DeltaAction::AddLabel(label),
                tx,
                DeltaOwner::Vertex(Arc::downgrade(&self.vertex)),
            );
            link_delta(tx, &mut payload.delta, delta);
        }
        payload.labels.swap_remove(position);
        Ok(true)
    }

    /// Sets (or, with a null value, clears) a property. Returns the old
    /// value.
    pub fn set_property(&self, property: PropertyId, value: PropertyValue) -> Result<PropertyValue> {
        let tx = &self.accessor.transaction;
        tx.check_cancellation()?;
        let storage = &self.accessor.storage;
        let mut payload = self.vertex.payload.lock();
        if self.transactional() && !prepare_for_write(tx, &payload.delta) {
            return Err(Error::Serialization);
        }
        if payload.deleted {
            return Err(Error::DeletedObject);
        }
        let old = payload
            .properties
            .get(&property)
            .cloned()
            .unwrap_or(PropertyValue::Null);
        if self.transactional() {
            let delta = Delta::new(
                DeltaAction::SetProperty {
                    key: property,
                    value: old.clone(),
                },
                tx,
                DeltaOwner::Vertex(Arc::downgrade(&self.vertex)),
            );
            link_delta(tx, &mut payload.delta, delta);
        }
        if value.is_null() {
            payload.properties.remove(&property);
        } else {
            payload.properties.insert(property, value.clone());
        }
        storage
            .indices
            .update_on_set_property(property, &value, &self.vertex, &payload, tx.start_timestamp);
        Ok(old)
    }

    // ---- reads -------------------------------------------------------

    pub fn labels(&self, view: View) -> Result<Vec<LabelId>> {
        let (view_timestamp, include_own) = self.accessor.view_components(view);
        let (mut labels, mut deleted, head) = {
            let payload = self.vertex.payload.lock();
            (
                payload.labels.to_vec(),
                payload.deleted,
                payload.delta.clone(),
            )
        };
        let mut exists = true;
        apply_deltas_for_read(
            head,
            self.accessor.transaction.id,
            view_timestamp,
            include_own,
            |action| match action {
                DeltaAction::AddLabel(label) => labels.push(*label),
                DeltaAction::RemoveLabel(label) => {
                    if let Some(position) = labels.iter().position(|existing| existing == label) {
                        labels.swap_remove(position);
                    }
                }
                DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
                DeltaAction::RecreateObject => deleted = false,
                _ => {}
            },
        );
        visibility_check(exists, deleted)?;
        Ok(labels)
    }

    pub fn has_label(&self, label: LabelId, view: View) -> Result<bool> {
        Ok(self.labels(view)?.contains(&label))
    }

    /// The property value at the view; `Null` when unset.
    pub fn get_property(&self, property: PropertyId, view: View) -> Result<PropertyValue> {
        let (view_timestamp, include_own) = self.accessor.view_components(view);
        let (mut value, mut deleted, head) = {
            let payload = self.vertex.payload.lock();
            (
                payload
                    .properties
                    .get(&property)
                    .cloned()
                    .unwrap_or(PropertyValue::Null),
                payload.deleted,
                payload.delta.clone(),
            )
        };
        let mut exists = true;
        apply_deltas_for_read(
            head,
            self.accessor.transaction.id,
            view_timestamp,
            include_own,
            |action| match action {
                DeltaAction::SetProperty { key, value: old } if *key == property => {
                    value = old.clone();
                }
                DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
                DeltaAction::RecreateObject => deleted = false,
                _ => {}
            },
        );
        visibility_check(exists, deleted)?;
        Ok(value)
    }

    pub fn properties(&self, view: View) -> Result<BTreeMap<PropertyId, PropertyValue>> {
        let (view_timestamp, include_own) = self.accessor.view_components(view);
        let (mut properties, mut deleted, head) = {
            let payload = self.vertex.payload.lock();
            (
                payload.properties.clone(),
                payload.deleted,
                payload.delta.clone(),
            )
        };
        let mut exists = true;
        apply_deltas_for_read(
            head,
            self.accessor.transaction.id,
            view_timestamp,
            include_own,
            |action| match action {
                DeltaAction::SetProperty { key, value } => {
                    if value.is_null() {
                        properties.remove(key);
                    } else {
                        properties.insert(*key, value.clone());
                    }
                }
                DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
                DeltaAction::RecreateObject => deleted = false,
                _ => {}
            },
        );
        visibility_check(exists, deleted)?;
        Ok(properties)
    }

    /// Outgoing edges at the view, optionally filtered by edge type.
    pub fn out_edges(&self, view: View, edge_types: &[EdgeTypeId]) -> Result<Vec<EdgeRef<'a>>> {
        self.edges(EdgeDirection::Out, view, edge_types)
    }

    /// Incoming edges at the view, optionally filtered by edge type.
    pub fn in_edges(&self, view: View, edge_types: &[EdgeTypeId]) -> Result<Vec<EdgeRef<'a>>> {
        self.edges(EdgeDirection::In, view, edge_types)
    }

    fn edges(
        &self,
        direction: EdgeDirection,
        view: View,
        edge_types: &[EdgeTypeId],
    ) -> Result<Vec<EdgeRef<'a>>> {
        let tx = &self.accessor.transaction;
        let (view_timestamp, include_own) = self.accessor.view_components(view);

        let entries = match tx.cached_edges(self.gid(), direction, view_timestamp, include_own) {
            Some(cached) => cached,
            None => {
                let (mut entries, mut deleted, head) = {
                    let payload = self.vertex.payload.lock();
                    let entries = match direction {
                        EdgeDirection::In => payload.in_edges.clone(),
                        EdgeDirection::Out => payload.out_edges.clone(),
                    };
                    (entries, payload.deleted, payload.delta.clone())
                };
                let mut exists = true;
                apply_deltas_for_read(head, tx.id, view_timestamp, include_own, |action| {
                    match (direction, action) {
                        (EdgeDirection::In, DeltaAction::AddInEdge(entry))
                        | (EdgeDirection::Out, DeltaAction::AddOutEdge(entry)) => {
                            entries.push(entry.clone());
                        }
                        (EdgeDirection::In, DeltaAction::RemoveInEdge(entry))
                        | (EdgeDirection::Out, DeltaAction::RemoveOutEdge(entry)) => {
                            if let Some(position) =
                                entries.iter().position(|existing| existing == entry)
                            {
                                entries.swap_remove(position);
                            }
                        }
                        (_, DeltaAction::DeleteObject)
                        | (_, DeltaAction::DeleteDeserializedObject) => exists = false,
                        (_, DeltaAction::RecreateObject) => deleted = false,
                        _ => {}
                    }
                });
                visibility_check(exists, deleted)?;
                let entries: Arc<Vec<EdgeEntry>> = Arc::new(entries);
                tx.cache_edges(
                    self.gid(),
                    direction,
                    view_timestamp,
                    include_own,
                    Arc::clone(&entries),
                );
                entries
            }
        };

        let own_gid = self.gid();
        Ok(entries
            .iter()
            .filter(|entry| edge_types.is_empty() || edge_types.contains(&entry.edge_type))
            .map(|entry| {
                let (from, to) = match direction {
                    EdgeDirection::Out => (own_gid, entry.neighbor),
                    EdgeDirection::In => (entry.neighbor, own_gid),
                };
                EdgeRef::new(entry.edge.clone(), entry.edge_type, from, to, self.accessor)
            })
            .collect())
    }
}

fn visibility_check(exists: bool, deleted: bool) -> Result<()> {
    if !exists {
        return Err(Error::NonexistentObject);
    }
    if deleted {
        return Err(Error::DeletedObject);
    }
    Ok(())
}
