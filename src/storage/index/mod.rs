mod label;
mod label_property;

pub(crate) use label::LabelIndex;
pub(crate) use label_property::LabelPropertyIndex;

use std::sync::Arc;

use crate::ids::{LabelId, PropertyId};
use crate::storage::vertex::{Vertex, VertexPayload};
use crate::value::PropertyValue;

/// The engine's index registry: one label index and one label+property
/// index. Writers feed both through the update hooks below; GC sweeps them
/// via `remove_obsolete_entries`.
#[derive(Default)]
pub(crate) struct Indices {
    pub(crate) label: LabelIndex,
    pub(crate) label_property: LabelPropertyIndex,
}

impl Indices {
    /// Hook invoked under the vertex lock right after a label was added.
    pub(crate) fn update_on_add_label(
        &self,
        label: LabelId,
        vertex: &Arc<Vertex>,
        payload: &VertexPayload,
        start_timestamp: u64,
    ) {
        self.label.update_on_add_label(label, vertex, start_timestamp);
        self.label_property
            .update_on_add_label(label, vertex, payload, start_timestamp);
    }

    /// Hook invoked under the vertex lock right after a property was set.
    /// Null writes delete the property and never create index entries.
    pub(crate) fn update_on_set_property(
        &self,
        property: PropertyId,
        value: &PropertyValue,
        vertex: &Arc<Vertex>,
        payload: &VertexPayload,
        start_timestamp: u64,
    ) {
        if value.is_null() {
            return;
        }
        self.label_property
            .update_on_set_property(property, value, vertex, payload, start_timestamp);
    }

    pub(crate) fn remove_obsolete_entries(&self, oldest_active: u64) {
        self.label.remove_obsolete_entries(oldest_active);
        self.label_property.remove_obsolete_entries(oldest_active);
    }

    pub(crate) fn total_entries(&self) -> usize {
        self.label.total_entries() + self.label_property.total_entries()
    }
}
