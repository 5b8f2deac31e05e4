//! Objects managed by the collector.
//!
//! An object is a slot in the [`ObjectTable`](super::table::ObjectTable): a
//! stable handle, an atomic flag word, an owning-cluster index and the field
//! storage laid out by its class. Outgoing references are [`RefSlot`]s holding
//! raw handles, so the trace can null them in place through a shared borrow.

use std::any::Any;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use super::class::ClassId;

/// Stable index of an object in the table. Index 0 is reserved for null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectHandle(NonZeroU32);

impl ObjectHandle {
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index)
            .ok()
            .and_then(NonZeroU32::new)
            .map(Self)
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub const fn index(self) -> usize {
        self.0.get() as usize
    }

    pub const fn to_raw(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({})", self.0)
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per-object state consulted and mutated by the collector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u32 {
        /// Not yet proven reachable during the current mark.
        const UNREACHABLE = 1 << 0;
        /// Explicitly killed; strong references to it are nulled by the trace.
        const PENDING_KILL = 1 << 1;
        /// Exempt from collection.
        const ROOT_SET = 1 << 2;
        /// Root of a cluster registered in the cluster registry.
        const CLUSTER_ROOT = 1 << 3;
        /// Cluster member referenced from outside its cluster this mark.
        const REACHABLE_IN_CLUSTER = 1 << 4;
        /// No strong edge has reached the object this mark.
        const NO_STRONG_REFERENCE = 1 << 5;
        /// Kept regardless of reachability.
        const KEEP_ALWAYS = 1 << 6;
        /// Still being constructed on another thread.
        const ASYNC = 1 << 7;
        /// BeginDestroy has been routed.
        const BEGIN_DESTROYED = 1 << 8;
        /// FinishDestroy has been routed.
        const FINISH_DESTROYED = 1 << 9;
        /// Caller-defined keep flag, honoured only when passed to a collection.
        const STANDALONE = 1 << 16;
        /// Caller-defined keep flag, honoured only when passed to a collection.
        const TRANSIENT = 1 << 17;
    }
}

impl ObjectFlags {
    /// Flags that keep an object alive on every collection.
    pub const GARBAGE_COLLECTION_KEEP_FLAGS: Self = Self::KEEP_ALWAYS.union(Self::ASYNC);

    /// Both destruction stages completed.
    pub const DESTROYED: Self = Self::BEGIN_DESTROYED.union(Self::FINISH_DESTROYED);
}

/// Flag word shared by every trace worker.
#[derive(Default)]
pub struct AtomicObjectFlags(AtomicU32);

impl AtomicObjectFlags {
    pub const fn new(flags: ObjectFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    pub fn load(&self) -> ObjectFlags {
        ObjectFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, flags: ObjectFlags) -> bool {
        self.load().contains(flags)
    }

    pub fn intersects(&self, flags: ObjectFlags) -> bool {
        self.load().intersects(flags)
    }

    pub fn insert(&self, flags: ObjectFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove(&self, flags: ObjectFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flags` and report whether this call was the one that cleared
    /// them. Of any number of racing callers exactly one observes `true`.
    pub fn try_clear(&self, flags: ObjectFlags) -> bool {
        let previous = self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
        previous & flags.bits() != 0
    }

    /// Set `flags` and report whether this call was the one that set them.
    pub fn try_insert(&self, flags: ObjectFlags) -> bool {
        let previous = self.0.fetch_or(flags.bits(), Ordering::AcqRel);
        previous & flags.bits() != flags.bits()
    }
}

impl fmt::Debug for AtomicObjectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

/// A reference-holding field. Stores the raw handle, 0 meaning null.
#[derive(Default)]
pub struct RefSlot(AtomicU32);

impl RefSlot {
    pub fn new(target: Option<ObjectHandle>) -> Self {
        Self(AtomicU32::new(target.map_or(0, ObjectHandle::to_raw)))
    }

    pub fn get(&self) -> Option<ObjectHandle> {
        ObjectHandle::from_raw(self.raw())
    }

    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, target: Option<ObjectHandle>) {
        self.0
            .store(target.map_or(0, ObjectHandle::to_raw), Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Clone for RefSlot {
    fn clone(&self) -> Self {
        Self(AtomicU32::new(self.raw()))
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(handle) => write!(f, "Ref({handle})"),
            None => f.write_str("Ref(null)"),
        }
    }
}

/// One storage cell of an object, addressed by its offset in the class layout.
pub enum Field {
    Value(u64),
    Ref(RefSlot),
    RefArray(Vec<RefSlot>),
    StructArray(Vec<Box<[Field]>>),
    /// Container whose references are enumerated by a native callback.
    Opaque(Box<dyn Any + Send + Sync>),
}

impl Field {
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Ref(_) => "reference",
            Self::RefArray(_) => "reference array",
            Self::StructArray(_) => "struct array",
            Self::Opaque(_) => "opaque container",
        }
    }

    pub fn as_ref_slot(&self) -> Option<&RefSlot> {
        match self {
            Self::Ref(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn as_ref_array(&self) -> Option<&[RefSlot]> {
        match self {
            Self::RefArray(slots) => Some(slots),
            _ => None,
        }
    }

    pub fn as_struct_array(&self) -> Option<&[Box<[Field]>]> {
        match self {
            Self::StructArray(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Opaque(container) => container.downcast_ref(),
            _ => None,
        }
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        match self {
            Self::Opaque(container) => container.downcast_mut(),
            _ => None,
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "Value({value})"),
            Self::Ref(slot) => fmt::Debug::fmt(slot, f),
            Self::RefArray(slots) => f.debug_list().entries(slots).finish(),
            Self::StructArray(elements) => f.debug_list().entries(elements).finish(),
            Self::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

/// A live entry of the object table.
#[derive(Debug)]
pub struct Object {
    handle: ObjectHandle,
    class: ClassId,
    name: String,
    flags: AtomicObjectFlags,
    owner: AtomicU32,
    fields: Box<[Field]>,
}

impl Object {
    pub(crate) fn new(
        handle: ObjectHandle,
        class: ClassId,
        name: String,
        fields: Box<[Field]>,
    ) -> Self {
        Self {
            handle,
            class,
            name,
            flags: AtomicObjectFlags::default(),
            owner: AtomicU32::new(0),
            fields,
        }
    }

    pub const fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub const fn class(&self) -> ClassId {
        self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn flags(&self) -> &AtomicObjectFlags {
        &self.flags
    }

    pub fn is_unreachable(&self) -> bool {
        self.flags.contains(ObjectFlags::UNREACHABLE)
    }

    pub fn is_pending_kill(&self) -> bool {
        self.flags.contains(ObjectFlags::PENDING_KILL)
    }

    pub fn is_rooted(&self) -> bool {
        self.flags.contains(ObjectFlags::ROOT_SET)
    }

    /// Root of the cluster this object belongs to, if any.
    pub fn owner(&self) -> Option<ObjectHandle> {
        ObjectHandle::from_raw(self.owner.load(Ordering::Acquire))
    }

    pub(crate) fn set_owner(&self, owner: Option<ObjectHandle>) {
        self.owner
            .store(owner.map_or(0, ObjectHandle::to_raw), Ordering::Release);
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut [Field] {
        &mut self.fields
    }

    pub fn field(&self, offset: usize) -> Option<&Field> {
        self.fields.get(offset)
    }

    pub fn field_mut(&mut self, offset: usize) -> Option<&mut Field> {
        self.fields.get_mut(offset)
    }
}
