mod config;
mod durability;
mod error;
mod ids;
mod scheduler;
mod storage;
mod value;

pub use crate::config::{Config, DurabilityMode};
pub use crate::error::{ConstraintViolation, ConstraintViolationKind, Error, Result};
pub use crate::ids::{EdgeTypeId, Gid, LabelId, PropertyId};
pub use crate::storage::{
    Accessor, EdgeRef, GcStats, IsolationLevel, SnapshotError, Storage, StorageInfo, StorageMode,
    VertexRef, View,
};
pub use crate::value::{PropertyValue, TemporalKind, TemporalValue};
