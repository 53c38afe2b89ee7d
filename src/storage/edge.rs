use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::{EdgeTypeId, Gid, PropertyId};
use crate::storage::delta::Delta;
use crate::value::PropertyValue;

/// A materialized edge object. Only allocated when the engine is configured
/// with properties on edges; otherwise edges exist purely as adjacency
/// entries carrying their gid.
pub(crate) struct Edge {
    pub(crate) gid: Gid,
    pub(crate) payload: Mutex<EdgePayload>,
}

pub(crate) struct EdgePayload {
    pub(crate) properties: BTreeMap<PropertyId, PropertyValue>,
    pub(crate) deleted: bool,
    pub(crate) delta: Option<Arc<Delta>>,
}

impl Edge {
    pub(crate) fn new(gid: Gid) -> Arc<Self> {
        Arc::new(Self {
            gid,
            payload: Mutex::new(EdgePayload {
                properties: BTreeMap::new(),
                deleted: false,
                delta: None,
            }),
        })
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge").field("gid", &self.gid).finish()
    }
}

/// Two-state edge reference stored in adjacency lists and delta payloads:
/// the full object when edge properties are enabled, the bare gid when not.
#[derive(Clone, Debug)]
pub(crate) enum EdgeRepr {
    Object(Arc<Edge>),
    Gid(Gid),
}

impl EdgeRepr {
    pub(crate) fn gid(&self) -> Gid {
        match self {
            EdgeRepr::Object(edge) => edge.gid,
            EdgeRepr::Gid(gid) => *gid,
        }
    }
}

impl PartialEq for EdgeRepr {
    fn eq(&self, other: &Self) -> bool {
        self.gid() == other.gid()
    }
}

impl Eq for EdgeRepr {}

/// One entry of a vertex's adjacency list. The neighbor is referenced by
/// gid; the object store maps remain the sole owners of vertices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EdgeEntry {
    pub(crate) edge_type: EdgeTypeId,
    pub(crate) neighbor: Gid,
    pub(crate) edge: EdgeRepr,
}
