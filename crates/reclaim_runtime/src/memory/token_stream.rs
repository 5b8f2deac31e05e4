//! Reference token streams.
//!
//! A class's references are compiled into a flat sequence of [`Token`]s that
//! the trace interprets without consulting the schema. Array tokens open a
//! nested range that ends at a [`Token::Return`]; their `skip` is the absolute
//! index of the token following that return, so an empty array jumps straight
//! past its elements.

use std::fmt;

use super::class::{
    ClassInfo, ClassReferenceFn, FieldKind, NativeReferenceFn, ReferenceCollector, ReferenceKind,
};
use super::object::{Field, Object, RefSlot};
use crate::error::{GcError, fatal};

#[derive(Debug, Clone, Copy)]
pub enum Token {
    Reference {
        offset: usize,
        kind: ReferenceKind,
    },
    ReferenceArray {
        offset: usize,
        kind: ReferenceKind,
    },
    FixedArray {
        offset: usize,
        stride: usize,
        count: usize,
        skip: usize,
    },
    StructArray {
        offset: usize,
        skip: usize,
    },
    NativeCollector {
        offset: usize,
        collector: NativeReferenceFn,
    },
    ClassCollector(ClassReferenceFn),
    Return,
    EndOfStream,
}

impl Token {
    fn rebase(&mut self, shift: usize) {
        match self {
            Self::FixedArray { skip, .. } | Self::StructArray { skip, .. } => *skip += shift,
            _ => {}
        }
    }
}

/// Where a token came from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDebugInfo {
    pub class: String,
    pub field: String,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    tokens: Vec<Token>,
    debug: Vec<TokenDebugInfo>,
}

impl TokenStream {
    pub(crate) fn assemble(info: &ClassInfo, parent: Option<&Self>) -> Self {
        let mut builder = TokenStreamBuilder::new(info.name());
        let mut offset = info.base_offset();
        for field in info.fields() {
            builder.emit_field(&field.name, &field.kind, offset);
            offset += field.kind.width();
        }
        if let Some(parent) = parent {
            builder.prepend(parent);
        }
        if let Some(collector) = info.class_collector() {
            builder.replace_or_add_class_collector(collector);
        }
        let stream = builder.finish();
        tracing::trace!(class = info.name(), tokens = stream.len(), "assembled token stream");
        stream
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True when the stream holds nothing but its end marker.
    pub fn is_empty(&self) -> bool {
        !self
            .tokens
            .iter()
            .any(|token| !matches!(token, Token::EndOfStream))
    }

    pub fn debug_info(&self, index: usize) -> Option<&TokenDebugInfo> {
        self.debug.get(index)
    }

    /// Human-readable origin of the token at `index`.
    pub fn describe(&self, index: usize) -> String {
        match self.debug.get(index) {
            Some(info) => format!(
                "class: {}, field: {}, offset: {}, token: {index}",
                info.class, info.field, info.offset
            ),
            None => format!("token: {index}"),
        }
    }

    /// Interpret the stream over `object`, reporting every reference slot.
    pub fn walk<'a, V: TokenVisitor<'a>>(&self, object: &'a Object, visitor: &mut V) {
        self.walk_range(object, object.fields(), 0, 0, self.tokens.len(), visitor);
    }

    fn walk_range<'a, V: TokenVisitor<'a>>(
        &self,
        object: &'a Object,
        fields: &'a [Field],
        base: usize,
        start: usize,
        end: usize,
        visitor: &mut V,
    ) {
        let mut index = start;
        while index < end {
            match self.tokens[index] {
                Token::Reference { offset, kind } => {
                    let field = field_at(object, fields, base + offset);
                    let Some(slot) = field.as_ref_slot() else {
                        mismatch(object, base + offset, "reference");
                    };
                    visitor.visit_reference(slot, kind, index);
                    index += 1;
                }
                Token::ReferenceArray { offset, kind } => {
                    let field = field_at(object, fields, base + offset);
                    let Some(slots) = field.as_ref_array() else {
                        mismatch(object, base + offset, "reference array");
                    };
                    for slot in slots {
                        visitor.visit_reference(slot, kind, index);
                    }
                    index += 1;
                }
                Token::FixedArray {
                    offset,
                    stride,
                    count,
                    skip,
                } => {
                    for element in 0..count {
                        let element_base = base + offset + element * stride;
                        self.walk_range(object, fields, element_base, index + 1, skip - 1, visitor);
                    }
                    index = skip;
                }
                Token::StructArray { offset, skip } => {
                    let field = field_at(object, fields, base + offset);
                    let Some(elements) = field.as_struct_array() else {
                        mismatch(object, base + offset, "struct array");
                    };
                    for element in elements {
                        self.walk_range(object, element, 0, index + 1, skip - 1, visitor);
                    }
                    index = skip;
                }
                Token::NativeCollector { offset, collector } => {
                    let field = field_at(object, fields, base + offset);
                    collector(
                        field,
                        &mut CollectorAdapter {
                            visitor: &mut *visitor,
                            token_index: index,
                        },
                    );
                    index += 1;
                }
                Token::ClassCollector(collector) => {
                    collector(
                        object,
                        &mut CollectorAdapter {
                            visitor: &mut *visitor,
                            token_index: index,
                        },
                    );
                    index += 1;
                }
                Token::Return => index += 1,
                Token::EndOfStream => break,
            }
        }
    }
}

fn field_at<'a>(object: &Object, fields: &'a [Field], offset: usize) -> &'a Field {
    fields
        .get(offset)
        .unwrap_or_else(|| mismatch(object, offset, "field"))
}

#[cold]
fn mismatch(object: &Object, offset: usize, expected: &'static str) -> ! {
    fatal(GcError::FieldMismatch {
        object: object.name().to_string(),
        offset,
        expected,
    })
}

/// Receives every reference slot found by [`TokenStream::walk`].
pub trait TokenVisitor<'a> {
    fn visit_reference(&mut self, slot: &'a RefSlot, kind: ReferenceKind, token_index: usize);
}

struct CollectorAdapter<'v, V> {
    visitor: &'v mut V,
    token_index: usize,
}

impl<'a, V: TokenVisitor<'a>> ReferenceCollector<'a> for CollectorAdapter<'_, V> {
    fn add_referenced_object(&mut self, slot: &'a RefSlot) {
        self.visitor
            .visit_reference(slot, ReferenceKind::Strong, self.token_index);
    }

    fn add_weak_referenced_object(&mut self, slot: &'a RefSlot) {
        self.visitor
            .visit_reference(slot, ReferenceKind::Weak, self.token_index);
    }
}

struct TokenStreamBuilder {
    class: String,
    tokens: Vec<Token>,
    debug: Vec<TokenDebugInfo>,
}

impl TokenStreamBuilder {
    fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
            tokens: Vec::new(),
            debug: Vec::new(),
        }
    }

    fn emit(&mut self, token: Token, field: &str, offset: usize) -> usize {
        self.tokens.push(token);
        self.debug.push(TokenDebugInfo {
            class: self.class.clone(),
            field: field.to_string(),
            offset,
        });
        self.tokens.len() - 1
    }

    /// Terminate the nested range opened at `opener` and point its skip past
    /// the return token.
    fn close_scope(&mut self, opener: usize, field: &str) {
        self.emit(Token::Return, field, 0);
        let end = self.tokens.len();
        match &mut self.tokens[opener] {
            Token::FixedArray { skip, .. } | Token::StructArray { skip, .. } => *skip = end,
            _ => unreachable!("scope opener must be an array token"),
        }
    }

    fn emit_field(&mut self, name: &str, kind: &FieldKind, offset: usize) {
        if !kind.holds_references() {
            return;
        }
        match kind {
            FieldKind::Value => {}
            FieldKind::Reference(kind) => {
                self.emit(Token::Reference { offset, kind: *kind }, name, offset);
            }
            FieldKind::ReferenceArray(kind) => {
                self.emit(Token::ReferenceArray { offset, kind: *kind }, name, offset);
            }
            FieldKind::FixedArray { element, count } => {
                if *count == 1 {
                    self.emit_field(name, element, offset);
                } else {
                    let opener = self.emit(
                        Token::FixedArray {
                            offset,
                            stride: element.width(),
                            count: *count,
                            skip: 0,
                        },
                        name,
                        offset,
                    );
                    self.emit_field(name, element, 0);
                    self.close_scope(opener, name);
                }
            }
            FieldKind::Struct(decl) => {
                let mut inner = offset;
                for field in &decl.fields {
                    self.emit_field(&format!("{name}.{}", field.name), &field.kind, inner);
                    inner += field.kind.width();
                }
            }
            FieldKind::StructArray(decl) => {
                let opener = self.emit(Token::StructArray { offset, skip: 0 }, name, offset);
                let mut inner = 0;
                for field in &decl.fields {
                    self.emit_field(&format!("{name}.{}", field.name), &field.kind, inner);
                    inner += field.kind.width();
                }
                self.close_scope(opener, name);
            }
            FieldKind::Container { collector, .. } => match collector {
                Some(collector) => {
                    self.emit(
                        Token::NativeCollector {
                            offset,
                            collector: *collector,
                        },
                        name,
                        offset,
                    );
                }
                None => fatal(GcError::MissingReferenceDescriptor {
                    class: self.class.clone(),
                    field: name.to_string(),
                }),
            },
        }
    }

    /// Place `parent`'s tokens, minus its end marker, in front of our own.
    fn prepend(&mut self, parent: &TokenStream) {
        let mut tokens: Vec<Token> = parent
            .tokens
            .iter()
            .copied()
            .filter(|token| !matches!(token, Token::EndOfStream))
            .collect();
        let shift = tokens.len();
        let mut debug = parent.debug[..shift].to_vec();

        for token in &mut self.tokens {
            token.rebase(shift);
        }
        tokens.append(&mut self.tokens);
        debug.append(&mut self.debug);
        self.tokens = tokens;
        self.debug = debug;
    }

    fn replace_or_add_class_collector(&mut self, collector: ClassReferenceFn) {
        let existing = self
            .tokens
            .iter()
            .position(|token| matches!(token, Token::ClassCollector(_)));
        match existing {
            Some(index) => {
                self.tokens[index] = Token::ClassCollector(collector);
                self.debug[index].class.clone_from(&self.class);
            }
            None => {
                self.emit(Token::ClassCollector(collector), "AddReferencedObjects", 0);
            }
        }
    }

    fn finish(mut self) -> TokenStream {
        self.emit(Token::EndOfStream, "EndOfStream", 0);
        TokenStream {
            tokens: self.tokens,
            debug: self.debug,
        }
    }
}

impl fmt::Display for TokenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, token) in self.tokens.iter().enumerate() {
            writeln!(f, "{index:4}: {token:?} ({})", self.describe(index))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::class::{ClassDescriptor, ClassRegistry, StructDecl};
    use crate::memory::object::{Object, ObjectHandle};

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(usize, ReferenceKind, usize)>,
    }

    impl<'a> TokenVisitor<'a> for Recorder {
        fn visit_reference(&mut self, slot: &'a RefSlot, kind: ReferenceKind, token_index: usize) {
            self.seen.push((slot.raw() as usize, kind, token_index));
        }
    }

    fn handle(index: usize) -> ObjectHandle {
        ObjectHandle::from_index(index).unwrap()
    }

    fn collect_bag<'a>(field: &'a Field, collector: &mut dyn ReferenceCollector<'a>) {
        if let Some(slots) = field.downcast_ref::<Vec<RefSlot>>() {
            for slot in slots {
                collector.add_referenced_object(slot);
            }
        }
    }

    #[test]
    fn test_fixed_array_scope_skips_past_return() {
        let mut registry = ClassRegistry::new();
        let id = registry
            .register(
                ClassDescriptor::new("Grid")
                    .field("weight", FieldKind::Value)
                    .field("cells", FieldKind::fixed_array(FieldKind::strong(), 4))
                    .field("next", FieldKind::strong()),
            )
            .unwrap();
        let stream = registry.token_stream(id).unwrap();
        let tokens = stream.tokens();

        assert!(matches!(
            tokens[0],
            Token::FixedArray { offset: 1, stride: 1, count: 4, skip: 3 }
        ));
        assert!(matches!(tokens[1], Token::Reference { offset: 0, .. }));
        assert!(matches!(tokens[2], Token::Return));
        assert!(matches!(tokens[3], Token::Reference { offset: 5, .. }));
        assert!(matches!(tokens[4], Token::EndOfStream));
        assert_eq!(stream.debug_info(3).unwrap().field, "next");
    }

    #[test]
    fn test_value_only_class_has_empty_stream() {
        let mut registry = ClassRegistry::new();
        let id = registry
            .register(
                ClassDescriptor::new("Plain")
                    .field("a", FieldKind::Value)
                    .field("b", FieldKind::fixed_array(FieldKind::Value, 8)),
            )
            .unwrap();
        assert!(registry.token_stream(id).unwrap().is_empty());
    }

    #[test]
    fn test_subclass_stream_prepends_and_rebases() {
        let mut registry = ClassRegistry::new();
        let base = registry
            .register(
                ClassDescriptor::new("Base")
                    .field("items", FieldKind::fixed_array(FieldKind::strong(), 2)),
            )
            .unwrap();
        let derived = registry
            .register(
                ClassDescriptor::new("Derived")
                    .extends(base)
                    .field("more", FieldKind::fixed_array(FieldKind::weak(), 3)),
            )
            .unwrap();

        let stream = registry.token_stream(derived).unwrap();
        let tokens = stream.tokens();
        assert_eq!(tokens.len(), 7);
        assert!(matches!(tokens[0], Token::FixedArray { offset: 0, skip: 3, .. }));
        assert!(matches!(tokens[3], Token::FixedArray { offset: 2, skip: 6, .. }));
        assert!(matches!(tokens[6], Token::EndOfStream));
        assert_eq!(stream.debug_info(0).unwrap().class, "Base");
        assert_eq!(stream.debug_info(3).unwrap().class, "Derived");
        assert!(registry.get(base).unwrap().has_token_stream());
    }

    #[test]
    fn test_walk_visits_every_slot() {
        let entry = Arc::new(
            StructDecl::new("Entry")
                .field("key", FieldKind::Value)
                .field("target", FieldKind::strong()),
        );
        let mut registry = ClassRegistry::new();
        let id = registry
            .register(
                ClassDescriptor::new("Holder")
                    .field("single", FieldKind::strong())
                    .field("observer", FieldKind::weak())
                    .field("list", FieldKind::ReferenceArray(ReferenceKind::Strong))
                    .field("entries", FieldKind::StructArray(Arc::clone(&entry)))
                    .field(
                        "bag",
                        FieldKind::Container {
                            holds_references: true,
                            collector: Some(collect_bag),
                            factory: || Box::new(Vec::<RefSlot>::new()),
                        },
                    ),
            )
            .unwrap();

        let mut fields = registry.instantiate_fields(id).unwrap();
        fields[0] = Field::Ref(RefSlot::new(Some(handle(10))));
        fields[1] = Field::Ref(RefSlot::new(Some(handle(11))));
        fields[2] = Field::RefArray(vec![
            RefSlot::new(Some(handle(12))),
            RefSlot::new(Some(handle(13))),
        ]);
        let mut element = entry.instantiate();
        element[1] = Field::Ref(RefSlot::new(Some(handle(14))));
        fields[3] = Field::StructArray(vec![element]);
        fields[4] = Field::Opaque(Box::new(vec![RefSlot::new(Some(handle(15)))]));
        let object = Object::new(handle(1), id, "holder".into(), fields);

        let mut recorder = Recorder::default();
        registry.token_stream(id).unwrap().walk(&object, &mut recorder);

        let targets: Vec<usize> = recorder.seen.iter().map(|(raw, _, _)| *raw).collect();
        assert_eq!(targets, vec![10, 11, 12, 13, 14, 15]);
        assert_eq!(recorder.seen[1].1, ReferenceKind::Weak);
    }

    #[test]
    fn test_empty_struct_array_jumps_to_skip() {
        let entry = Arc::new(StructDecl::new("Entry").field("target", FieldKind::strong()));
        let mut registry = ClassRegistry::new();
        let id = registry
            .register(
                ClassDescriptor::new("Table")
                    .field("entries", FieldKind::StructArray(entry))
                    .field("tail", FieldKind::strong()),
            )
            .unwrap();

        let mut fields = registry.instantiate_fields(id).unwrap();
        fields[1] = Field::Ref(RefSlot::new(Some(handle(7))));
        let object = Object::new(handle(1), id, "table".into(), fields);

        let mut recorder = Recorder::default();
        registry.token_stream(id).unwrap().walk(&object, &mut recorder);
        assert_eq!(recorder.seen.len(), 1);
        assert_eq!(recorder.seen[0].0, 7);
    }

    #[test]
    fn test_class_collector_replaced_by_subclass() {
        fn base_hook<'a>(_: &'a Object, _: &mut dyn ReferenceCollector<'a>) {}
        fn derived_hook<'a>(_: &'a Object, _: &mut dyn ReferenceCollector<'a>) {}

        let mut registry = ClassRegistry::new();
        let base = registry
            .register(
                ClassDescriptor::new("Base")
                    .field("a", FieldKind::strong())
                    .add_referenced_objects(base_hook),
            )
            .unwrap();
        let derived = registry
            .register(
                ClassDescriptor::new("Derived")
                    .extends(base)
                    .field("b", FieldKind::strong())
                    .add_referenced_objects(derived_hook),
            )
            .unwrap();

        let tokens = registry.token_stream(derived).unwrap().tokens();
        let collectors = tokens
            .iter()
            .filter(|token| matches!(token, Token::ClassCollector(_)))
            .count();
        assert_eq!(collectors, 1);
        assert_eq!(tokens.len(), 4);
    }
}
