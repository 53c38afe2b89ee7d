use std::fmt;
use std::io;

use thiserror::Error;

use crate::ids::{LabelId, PropertyId};

pub type Result<T> = std::result::Result<T, Error>;

/// Which constraint kind a [`ConstraintViolation`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintViolationKind {
    Existence,
    Unique,
}

/// Details of an existence or uniqueness constraint failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub kind: ConstraintViolationKind,
    pub label: LabelId,
    pub properties: Vec<PropertyId>,
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ConstraintViolationKind::Existence => "existence",
            ConstraintViolationKind::Unique => "unique",
        };
        write!(f, "{} constraint on label {} properties [", kind, self.label)?;
        for (i, property) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", property)?;
        }
        write!(f, "]")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("serialization error: a concurrent transaction modified the same object")]
    Serialization,
    #[error("cannot operate on a deleted object")]
    DeletedObject,
    #[error("object does not exist at the requested view")]
    NonexistentObject,
    #[error("vertex has edges and cannot be deleted without detach")]
    VertexHasEdges,
    #[error("edge properties are disabled in this configuration")]
    PropertiesDisabled,
    #[error("constraint violation: {0}")]
    ConstraintViolation(ConstraintViolation),
    #[error("index definition error: {0}")]
    IndexDefinition(&'static str),
    #[error("constraint definition error: {0}")]
    ConstraintDefinition(&'static str),
    #[error("replication error: commit persisted locally but not on all sync replicas")]
    Replication,
    #[error("recovery error: {0}")]
    Recovery(String),
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transaction was terminated")]
    TransactionTerminated,
    #[error("transaction deadline exceeded")]
    TransactionTimeout,
}

impl Error {
    /// Whether the client may retry the whole transaction after seeing this
    /// error. Constraint and object-state errors are final for the given
    /// transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Serialization
                | Error::Replication
                | Error::TransactionTerminated
                | Error::TransactionTimeout
        )
    }
}
