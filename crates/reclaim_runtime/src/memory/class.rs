//! Class schemas and the registry that owns them.
//!
//! A class lists its fields in declaration order. Each field occupies one or
//! more consecutive cells of the object's field storage; a subclass's own
//! fields follow its superclass's. The registry assembles each class's token
//! stream on first use and caches it for the lifetime of the class.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use once_cell::sync::OnceCell;

use super::object::{Field, Object, RefSlot};
use super::token_stream::TokenStream;
use crate::error::{GcError, GcResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Strong,
    Weak,
}

/// Receives the references a native callback enumerates.
pub trait ReferenceCollector<'a> {
    fn add_referenced_object(&mut self, slot: &'a RefSlot);

    fn add_weak_referenced_object(&mut self, slot: &'a RefSlot);

    fn add_reference(&mut self, slot: &'a RefSlot, kind: ReferenceKind) {
        match kind {
            ReferenceKind::Strong => self.add_referenced_object(slot),
            ReferenceKind::Weak => self.add_weak_referenced_object(slot),
        }
    }
}

/// Enumerates the references held by an opaque container field.
pub type NativeReferenceFn = for<'a> fn(&'a Field, &mut dyn ReferenceCollector<'a>);

/// Class-level hook enumerating references the field layout does not describe.
pub type ClassReferenceFn = for<'a> fn(&'a Object, &mut dyn ReferenceCollector<'a>);

pub type DestroyFn = fn(&Object);
pub type ReadinessFn = fn(&Object) -> bool;
pub type ContainerFactory = fn() -> Box<dyn Any + Send + Sync>;

#[derive(Clone)]
pub enum FieldKind {
    /// Plain data, never traced.
    Value,
    Reference(ReferenceKind),
    /// Growable array of references.
    ReferenceArray(ReferenceKind),
    /// `count` consecutive inline elements.
    FixedArray { element: Box<FieldKind>, count: usize },
    /// Inline struct, flattened into the enclosing layout.
    Struct(Arc<StructDecl>),
    /// Growable array of struct elements.
    StructArray(Arc<StructDecl>),
    /// Opaque container; references inside it are reported by `collector`.
    Container {
        holds_references: bool,
        collector: Option<NativeReferenceFn>,
        factory: ContainerFactory,
    },
}

impl FieldKind {
    pub const fn strong() -> Self {
        Self::Reference(ReferenceKind::Strong)
    }

    pub const fn weak() -> Self {
        Self::Reference(ReferenceKind::Weak)
    }

    pub fn fixed_array(element: Self, count: usize) -> Self {
        Self::FixedArray {
            element: Box::new(element),
            count,
        }
    }

    /// Number of field cells this kind occupies.
    pub fn width(&self) -> usize {
        match self {
            Self::FixedArray { element, count } => element.width() * count,
            Self::Struct(decl) => decl.width(),
            _ => 1,
        }
    }

    pub fn holds_references(&self) -> bool {
        match self {
            Self::Value => false,
            Self::Reference(_) | Self::ReferenceArray(_) => true,
            Self::FixedArray { element, count } => *count > 0 && element.holds_references(),
            Self::Struct(decl) | Self::StructArray(decl) => decl.holds_references(),
            Self::Container {
                holds_references, ..
            } => *holds_references,
        }
    }

    fn instantiate_into(&self, out: &mut Vec<Field>) {
        match self {
            Self::Value => out.push(Field::Value(0)),
            Self::Reference(_) => out.push(Field::Ref(RefSlot::default())),
            Self::ReferenceArray(_) => out.push(Field::RefArray(Vec::new())),
            Self::FixedArray { element, count } => {
                for _ in 0..*count {
                    element.instantiate_into(out);
                }
            }
            Self::Struct(decl) => decl.instantiate_into(out),
            Self::StructArray(_) => out.push(Field::StructArray(Vec::new())),
            Self::Container { factory, .. } => out.push(Field::Opaque(factory())),
        }
    }

    fn check(&self, owner: &str, field: &str) -> GcResult<()> {
        match self {
            Self::Container {
                holds_references: true,
                collector: None,
                ..
            } => Err(GcError::MissingReferenceDescriptor {
                class: owner.to_string(),
                field: field.to_string(),
            }),
            Self::FixedArray { element, .. } => element.check(owner, field),
            Self::Struct(decl) | Self::StructArray(decl) => decl.check(owner),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value => f.write_str("Value"),
            Self::Reference(kind) => write!(f, "Reference({kind:?})"),
            Self::ReferenceArray(kind) => write!(f, "ReferenceArray({kind:?})"),
            Self::FixedArray { element, count } => write!(f, "FixedArray({element:?}; {count})"),
            Self::Struct(decl) => write!(f, "Struct({})", decl.name),
            Self::StructArray(decl) => write!(f, "StructArray({})", decl.name),
            Self::Container {
                holds_references,
                collector,
                ..
            } => f
                .debug_struct("Container")
                .field("holds_references", holds_references)
                .field("has_collector", &collector.is_some())
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Layout of an inline or array-element struct.
#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
}

impl StructDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDecl::new(name, kind));
        self
    }

    pub fn width(&self) -> usize {
        self.fields.iter().map(|field| field.kind.width()).sum()
    }

    pub fn holds_references(&self) -> bool {
        self.fields.iter().any(|field| field.kind.holds_references())
    }

    /// Default-initialised storage for one element of this struct.
    pub fn instantiate(&self) -> Box<[Field]> {
        let mut fields = Vec::with_capacity(self.width());
        self.instantiate_into(&mut fields);
        fields.into_boxed_slice()
    }

    fn instantiate_into(&self, out: &mut Vec<Field>) {
        for field in &self.fields {
            field.kind.instantiate_into(out);
        }
    }

    fn check(&self, owner: &str) -> GcResult<()> {
        for field in &self.fields {
            field
                .kind
                .check(owner, &format!("{}.{}", self.name, field.name))?;
        }
        Ok(())
    }
}

/// Destruction hooks routed by the incremental purge.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassLifecycle {
    pub begin_destroy: Option<DestroyFn>,
    pub is_ready_for_finish_destroy: Option<ReadinessFn>,
    pub finish_destroy: Option<DestroyFn>,
}

impl ClassLifecycle {
    fn inherit(self, parent: Self) -> Self {
        Self {
            begin_destroy: self.begin_destroy.or(parent.begin_destroy),
            is_ready_for_finish_destroy: self
                .is_ready_for_finish_destroy
                .or(parent.is_ready_for_finish_destroy),
            finish_destroy: self.finish_destroy.or(parent.finish_destroy),
        }
    }
}

/// Registration-time description of a class.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub name: String,
    pub super_class: Option<ClassId>,
    pub fields: Vec<FieldDecl>,
    pub add_referenced_objects: Option<ClassReferenceFn>,
    pub lifecycle: ClassLifecycle,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_class: None,
            fields: Vec::new(),
            add_referenced_objects: None,
            lifecycle: ClassLifecycle::default(),
        }
    }

    #[must_use]
    pub const fn extends(mut self, super_class: ClassId) -> Self {
        self.super_class = Some(super_class);
        self
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDecl::new(name, kind));
        self
    }

    #[must_use]
    pub fn add_referenced_objects(mut self, collector: ClassReferenceFn) -> Self {
        self.add_referenced_objects = Some(collector);
        self
    }

    #[must_use]
    pub fn on_begin_destroy(mut self, hook: DestroyFn) -> Self {
        self.lifecycle.begin_destroy = Some(hook);
        self
    }

    #[must_use]
    pub fn ready_for_finish_destroy(mut self, hook: ReadinessFn) -> Self {
        self.lifecycle.is_ready_for_finish_destroy = Some(hook);
        self
    }

    #[must_use]
    pub fn on_finish_destroy(mut self, hook: DestroyFn) -> Self {
        self.lifecycle.finish_destroy = Some(hook);
        self
    }

    fn own_width(&self) -> usize {
        self.fields.iter().map(|field| field.kind.width()).sum()
    }
}

/// A registered class.
#[derive(Debug)]
pub struct ClassInfo {
    id: ClassId,
    descriptor: ClassDescriptor,
    /// Offset of the first own field; equals the superclass's width.
    base_offset: usize,
    width: usize,
    lifecycle: ClassLifecycle,
    token_stream: OnceCell<TokenStream>,
}

impl ClassInfo {
    pub const fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub const fn super_class(&self) -> Option<ClassId> {
        self.descriptor.super_class
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.descriptor.fields
    }

    pub const fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Total field cells of an instance, inherited fields included.
    pub const fn width(&self) -> usize {
        self.width
    }

    pub const fn lifecycle(&self) -> ClassLifecycle {
        self.lifecycle
    }

    pub const fn class_collector(&self) -> Option<ClassReferenceFn> {
        self.descriptor.add_referenced_objects
    }

    /// Whether the token stream has been assembled yet.
    pub fn has_token_stream(&self) -> bool {
        self.token_stream.get().is_some()
    }
}

#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<ClassInfo>,
    by_name: AHashMap<String, ClassId>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ClassDescriptor) -> GcResult<ClassId> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(GcError::DuplicateClass(descriptor.name));
        }
        for field in &descriptor.fields {
            field.kind.check(&descriptor.name, &field.name)?;
        }

        let (base_offset, lifecycle) = match descriptor.super_class {
            Some(super_id) => {
                let parent = self.get(super_id)?;
                (parent.width, descriptor.lifecycle.inherit(parent.lifecycle))
            }
            None => (0, descriptor.lifecycle),
        };

        let id = ClassId(
            u32::try_from(self.classes.len()).map_err(|_| GcError::Config {
                key: "class count",
                value: self.classes.len().to_string(),
            })?,
        );
        let width = base_offset + descriptor.own_width();
        tracing::debug!(class = %descriptor.name, width, "registered class");

        self.by_name.insert(descriptor.name.clone(), id);
        self.classes.push(ClassInfo {
            id,
            descriptor,
            base_offset,
            width,
            lifecycle,
            token_stream: OnceCell::new(),
        });
        Ok(id)
    }

    pub fn get(&self, id: ClassId) -> GcResult<&ClassInfo> {
        self.classes
            .get(id.index())
            .ok_or(GcError::UnknownClass(id))
    }

    pub fn find(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn is_child_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get(id).ok().and_then(ClassInfo::super_class);
        }
        false
    }

    /// The class's token stream, assembled on first request.
    pub fn token_stream(&self, id: ClassId) -> GcResult<&TokenStream> {
        let info = self.get(id)?;
        let stream = info.token_stream.get_or_try_init(|| {
            let parent = match info.super_class() {
                Some(super_id) => Some(self.token_stream(super_id)?),
                None => None,
            };
            Ok::<_, GcError>(TokenStream::assemble(info, parent))
        })?;
        Ok(stream)
    }

    /// Default-initialised field storage for a new instance.
    pub fn instantiate_fields(&self, id: ClassId) -> GcResult<Box<[Field]>> {
        let info = self.get(id)?;
        let mut fields = Vec::with_capacity(info.width);
        self.instantiate_into(info, &mut fields)?;
        Ok(fields.into_boxed_slice())
    }

    fn instantiate_into(&self, info: &ClassInfo, out: &mut Vec<Field>) -> GcResult<()> {
        if let Some(super_id) = info.super_class() {
            self.instantiate_into(self.get(super_id)?, out)?;
        }
        for field in info.fields() {
            field.kind.instantiate_into(out);
        }
        Ok(())
    }
}
