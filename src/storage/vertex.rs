use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::ids::{Gid, LabelId, PropertyId};
use crate::storage::delta::Delta;
use crate::storage::edge::EdgeEntry;
use crate::value::PropertyValue;

/// A vertex: stable gid plus a payload guarded by the per-object lock.
///
/// The payload always reflects the newest (possibly uncommitted) state;
/// older versions are reconstructed by replaying the inverse deltas hanging
/// off `delta`.
pub(crate) struct Vertex {
    pub(crate) gid: Gid,
    pub(crate) payload: Mutex<VertexPayload>,
}

pub(crate) struct VertexPayload {
    pub(crate) labels: SmallVec<[LabelId; 4]>,
    pub(crate) properties: BTreeMap<PropertyId, PropertyValue>,
    pub(crate) in_edges: Vec<EdgeEntry>,
    pub(crate) out_edges: Vec<EdgeEntry>,
    pub(crate) deleted: bool,
    pub(crate) delta: Option<Arc<Delta>>,
}

impl Vertex {
    pub(crate) fn new(gid: Gid) -> Arc<Self> {
        Arc::new(Self {
            gid,
            payload: Mutex::new(VertexPayload {
                labels: SmallVec::new(),
                properties: BTreeMap::new(),
                in_edges: Vec::new(),
                out_edges: Vec::new(),
                deleted: false,
                delta: None,
            }),
        })
    }
}

impl std::fmt::Debug for Vertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vertex").field("gid", &self.gid).finish()
    }
}
