//! Error taxonomy for the collector.
//!
//! API misuse is reported through [`GcError`]. Graph corruption and purge
//! protocol violations are unrecoverable: they are logged and raised through
//! [`fatal`], because continuing over a corrupt graph risks freeing live data.

use thiserror::Error;

use crate::memory::{ClassId, ObjectHandle};

pub type GcResult<T> = Result<T, GcError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    #[error("unknown class id {0:?}")]
    UnknownClass(ClassId),

    #[error("class `{0}` is already registered")]
    DuplicateClass(String),

    #[error("invalid or freed object handle {0}")]
    InvalidHandle(ObjectHandle),

    #[error("object table is full")]
    TableExhausted,

    #[error("field {offset} of `{object}` is not a {expected}")]
    FieldMismatch {
        object: String,
        offset: usize,
        expected: &'static str,
    },

    #[error("field `{field}` of `{class}` holds references but has no reference descriptor")]
    MissingReferenceDescriptor { class: String, field: String },

    #[error("cannot cluster {object}: {reason}")]
    InvalidCluster {
        object: ObjectHandle,
        reason: &'static str,
    },

    #[error("object {0} is in the root set and cannot be marked pending kill")]
    RootedPendingKill(ObjectHandle),

    #[error(
        "invalid object in GC: {target}, referencing object: {referencing}, {token}"
    )]
    CorruptReference {
        target: u32,
        referencing: String,
        token: String,
    },

    #[error("cluster invariant violated: {0}")]
    ClusterInvariant(String),

    #[error("object {object} reached the final purge sweep without {missing}")]
    PurgeProtocol {
        object: ObjectHandle,
        missing: &'static str,
    },

    #[error("failed to build GC worker pool: {0}")]
    ThreadPool(String),

    #[error("invalid configuration value for {key}: {value}")]
    Config { key: &'static str, value: String },
}

/// Log an unrecoverable collector error and abort the current operation.
#[cold]
#[track_caller]
pub fn fatal(error: GcError) -> ! {
    tracing::error!("{error}");
    panic!("{error}");
}
