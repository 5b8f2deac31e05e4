pub mod array_pool;
pub mod class;
pub mod cluster;
pub mod config;
pub mod gc;
pub mod object;
pub mod processor;
pub mod purge;
pub mod reachability;
pub mod sync;
pub mod table;
pub mod token_stream;

pub use array_pool::{ArrayPoolStats, GcArrayPool};
pub use class::{
    ClassDescriptor, ClassId, ClassInfo, ClassLifecycle, ClassRegistry, FieldDecl, FieldKind,
    ReferenceCollector, ReferenceKind, StructDecl,
};
pub use cluster::{Cluster, ClusterRegistry};
pub use config::GcConfig;
pub use gc::{GcContext, GcStats};
pub use object::{Field, Object, ObjectFlags, ObjectHandle, RefSlot};
pub use purge::PurgeProgress;
pub use sync::{AsyncLockGuard, GcSyncObject};
pub use table::ObjectTable;
pub use token_stream::{Token, TokenStream, TokenVisitor};
