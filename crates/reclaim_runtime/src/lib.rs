//! Parallel, incremental tracing garbage collector.
//!
//! Objects live in an index-addressed table owned by a [`memory::GcContext`].
//! A collection marks everything unreachable, traces from the root set across
//! a worker pool guided by per-class token streams, dissolves dead clusters and
//! hands the survivors' garbage to a resumable, time-budgeted purge.

pub mod config;
pub mod error;
pub mod memory;

pub use config::{LoggingConfig, RuntimeConfig};
pub use error::{GcError, GcResult};
pub use memory::{
    ClassDescriptor, ClassId, FieldDecl, FieldKind, GcConfig, GcContext, GcStats, ObjectFlags,
    ObjectHandle,
};
