use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ids::{EdgeTypeId, Gid, PropertyId};
use crate::storage::accessor::{Accessor, VertexRef};
use crate::storage::delta::{
    apply_deltas_for_read, link_delta, prepare_for_write, Delta, DeltaAction, DeltaOwner,
};
use crate::storage::edge::EdgeRepr;
use crate::storage::transaction::StorageMode;
use crate::storage::View;
use crate::value::PropertyValue;

/// Handle to one edge inside an open transaction. Carries the endpoints it
/// was resolved with; with properties-on-edges disabled the handle is the
/// complete edge state.
pub struct EdgeRef<'a> {
    pub(crate) repr: EdgeRepr,
    edge_type: EdgeTypeId,
    from_gid: Gid,
    to_gid: Gid,
    pub(crate) accessor: &'a Accessor,
}

impl<'a> EdgeRef<'a> {
    pub(crate) fn new(
        repr: EdgeRepr,
        edge_type: EdgeTypeId,
        from_gid: Gid,
        to_gid: Gid,
        accessor: &'a Accessor,
    ) -> Self {
        Self {
            repr,
            edge_type,
            from_gid,
            to_gid,
            accessor,
        }
    }

    pub fn gid(&self) -> Gid {
        self.repr.gid()
    }

    pub fn edge_type(&self) -> EdgeTypeId {
        self.edge_type
    }

    pub fn from_gid(&self) -> Gid {
        self.from_gid
    }

    pub fn to_gid(&self) -> Gid {
        self.to_gid
    }

    pub fn from_vertex(&self) -> Result<VertexRef<'a>> {
        self.endpoint(self.from_gid)
    }

    pub fn to_vertex(&self) -> Result<VertexRef<'a>> {
        self.endpoint(self.to_gid)
    }

    fn endpoint(&self, gid: Gid) -> Result<VertexRef<'a>> {
        let vertex = self
            .accessor
            .storage
            .vertices
            .read()
            .get(&gid)
            .cloned()
            .ok_or(Error::NonexistentObject)?;
        Ok(VertexRef::new(vertex, self.accessor))
    }

    fn transactional(&self) -> bool {
        self.accessor.transaction.storage_mode == StorageMode::Transactional
    }

    /// Sets (or clears) an edge property. Fails with
    /// [`Error::PropertiesDisabled`] when the engine is configured without
    /// properties on edges.
    pub fn set_property(&self, property: PropertyId, value: PropertyValue) -> Result<PropertyValue> {
        let tx = &self.accessor.transaction;
        tx.check_cancellation()?;
        let EdgeRepr::Object(edge) = &self.repr else {
            return Err(Error::PropertiesDisabled);
        };
        let mut payload = edge.payload.lock();
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
                DeltaOwner::Edge(Arc::downgrade(edge)),
            );
            link_delta(tx, &mut payload.delta, delta);
        }
        if value.is_null() {
            payload.properties.remove(&property);
        } else {
            payload.properties.insert(property, value);
        }
        Ok(old)
    }

    /// The property value at the view; `Null` when unset or when edge
    /// properties are disabled.
    pub fn get_property(&self, property: PropertyId, view: View) -> Result<PropertyValue> {
        let EdgeRepr::Object(edge) = &self.repr else {
            return Ok(PropertyValue::Null);
        };
        let (view_timestamp, include_own) = self.accessor.view_components(view);
        let (mut value, mut deleted, head) = {
            let payload = edge.payload.lock();
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

    /// All properties at the view; empty when edge properties are disabled.
    pub fn properties(&self, view: View) -> Result<BTreeMap<PropertyId, PropertyValue>> {
        let EdgeRepr::Object(edge) = &self.repr else {
            return Ok(BTreeMap::new());
        };
        let (view_timestamp, include_own) = self.accessor.view_components(view);
        let (mut properties, mut deleted, head) = {
            let payload = edge.payload.lock();
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
