//! # Binary Wire-Format Schema IR
//!
//! Defines the schema for describing families of binary record types: field
//! layouts, length rules, variant discrimination, integrity checks, and
//! cross-field dependencies.
//!
//! A schema document is a mapping with a `config` record (default byte order
//! and bit order) and a `types` mapping. Declaration order of types and
//! fields is meaningful and survives deserialization through `IndexMap`.

use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

use crate::runtime::bitstream::{BitOrder, ByteOrder};
use crate::runtime::varlength::VarlengthEncoding;

/// A parsed and validated schema document.
#[derive(Debug, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub config: SchemaConfig,
    pub types: IndexMap<String, TypeDef>,
}

/// Stream-wide defaults; individual integer and float fields may override
/// the byte order.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub endianness: ByteOrder,
    pub bit_order: BitOrder,
}

/// One named type in the schema.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeDef {
    /// Ordered sequence of fields, optionally followed by position-addressed
    /// instance fields decoded after the sequence.
    Composite(CompositeType),
    /// A single wrapped value under another name.
    Alias(AliasType),
    /// A discriminated union of named variant types.
    Union(UnionType),
}

#[derive(Debug, Deserialize)]
pub struct CompositeType {
    #[serde(default)]
    pub sequence: Vec<Field>,
    #[serde(default)]
    pub instances: Vec<InstanceField>,
}

#[derive(Debug, Deserialize)]
pub struct AliasType {
    pub value: FieldType,
}

#[derive(Debug, Deserialize)]
pub struct UnionType {
    pub discriminator: Discriminator,
    pub variants: Vec<UnionVariant>,
}

/// How a union picks its variant.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discriminator {
    /// Peek an integer at the stream without advancing, then test each
    /// variant's `when` clause in order.
    Peek { int: IntegerType },
    /// The discriminator value is a named field resolved from a parent frame
    /// through the decode context.
    Field { name: String },
}

#[derive(Debug, Deserialize)]
pub struct UnionVariant {
    pub type_name: String,
    /// Predicate over the discriminator value. A variant without `when` is
    /// the fallback for peek-based unions.
    #[serde(default)]
    pub when: Option<WhenClause>,
}

/// Comparison of the discriminator value against a literal.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WhenClause {
    pub op: CompareOp,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The Rust comparison operator this clause emits.
    pub fn as_rust(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// One field of a composite's forward sequence.
///
/// The wire shape is flattened into the field mapping, so a schema author
/// writes `{ name: magic, type: uint, width: 32, const: 0x04034b50 }`.
#[derive(Debug, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(flatten)]
    pub ty: FieldType,
    /// Fixed literal emitted at encode and validated at decode.
    #[serde(default, rename = "const")]
    pub const_value: Option<ConstValue>,
    /// Value derived at encode from other fields; ignored if supplied.
    #[serde(default)]
    pub computed: Option<ComputedSpec>,
    /// Field is present only when the predicate holds.
    #[serde(default)]
    pub conditional: Option<Predicate>,
    /// Sibling field naming the exact byte budget of this value; the decoder
    /// reads that many bytes into a sub-stream (DER TLV contents).
    #[serde(default)]
    pub byte_budget: Option<String>,
}

/// A field decoded after the forward sequence by seeking to a declared
/// position. Instance fields appear in the Output view only.
#[derive(Debug, Deserialize)]
pub struct InstanceField {
    pub name: String,
    #[serde(flatten)]
    pub ty: FieldType,
    pub offset: InstanceOffset,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InstanceOffset {
    /// Non-negative: absolute byte offset from the message start.
    /// Negative: offset back from the end of the buffer.
    Fixed(i64),
    /// Offset read from a named field decoded earlier in the same frame.
    FieldRef(String),
}

/// Wire shape of a field or array element.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Uint(IntegerType),
    Int(IntegerType),
    Float(FloatType),
    Bits(BitsType),
    Varlength(VarlengthType),
    String(StringType),
    Array(Box<ArrayType>),
    Optional(Box<OptionalType>),
    Padding(PaddingType),
    TypeRef(TypeRefType),
    BackReference(BackReferenceType),
    /// Inline union resolved by try-decode: variants are attempted in order
    /// and `const` mismatches reject an attempt.
    Choice(ChoiceType),
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntegerType {
    /// Width in bits: 8, 16, 32, or 64.
    pub width: u32,
    #[serde(default)]
    pub endianness: Option<ByteOrder>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FloatType {
    /// Width in bits: 32 or 64.
    pub width: u32,
    #[serde(default)]
    pub endianness: Option<ByteOrder>,
}

/// Bit-granular field, optionally decomposed into named sub-fields whose
/// widths must sum to the total.
#[derive(Debug, Deserialize)]
pub struct BitsType {
    pub width: u32,
    #[serde(default)]
    pub subfields: Vec<BitSubfield>,
}

#[derive(Debug, Deserialize)]
pub struct BitSubfield {
    pub name: String,
    pub width: u32,
}

#[derive(Debug, Deserialize)]
pub struct VarlengthType {
    pub encoding: VarlengthEncoding,
}

#[derive(Debug, Deserialize)]
pub struct StringType {
    pub kind: StringKind,
    #[serde(default)]
    pub encoding: StringEncoding,
    /// Length-prefix integer for `length_prefixed`.
    #[serde(default)]
    pub prefix: Option<IntegerType>,
    /// Byte length for `fixed`.
    #[serde(default)]
    pub length: Option<usize>,
    /// Sibling or ancestor field holding the byte length for
    /// `field_referenced`.
    #[serde(default)]
    pub length_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringKind {
    LengthPrefixed,
    NullTerminated,
    Fixed,
    FieldReferenced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringEncoding {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

#[derive(Debug, Deserialize)]
pub struct ArrayType {
    pub kind: ArrayKind,
    pub items: FieldType,
    /// Length/count prefix integer for the prefixed kinds.
    #[serde(default)]
    pub prefix: Option<IntegerType>,
    /// Element count for `fixed`.
    #[serde(default)]
    pub count: Option<usize>,
    /// Field holding the element count (`field_referenced`,
    /// `computed_count`) or the byte budget (`byte_budgeted`).
    #[serde(default)]
    pub length_field: Option<String>,
    /// Variant type name that ends a `variant_terminated` array. The
    /// terminator element is part of the array value.
    #[serde(default)]
    pub terminator: Option<String>,
    /// Byte signature that ends a `signature_terminated` array: iteration
    /// stops when the upcoming bytes no longer start with the signature.
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayKind {
    /// Element count prefix, then the elements.
    LengthPrefixed,
    /// Total byte length prefix, then the elements.
    ByteLengthPrefixed,
    /// Each element carries its own byte-length prefix.
    LengthPrefixedItems,
    /// Exactly `count` elements, no framing.
    Fixed,
    /// Element count read from a named field.
    FieldReferenced,
    /// Elements until a zero terminator byte.
    NullTerminated,
    /// Elements until the stream is exhausted.
    EofTerminated,
    /// Elements until a byte budget (from a named field) is consumed.
    ByteBudgeted,
    /// Elements until (and including) an element of the terminator variant.
    VariantTerminated,
    /// Elements while the upcoming bytes start with a signature.
    SignatureTerminated,
    /// Element count read from a `count_of` computed field.
    ComputedCount,
}

#[derive(Debug, Deserialize)]
pub struct OptionalType {
    pub value: FieldType,
    #[serde(default)]
    pub marker: PresenceMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceMarker {
    #[default]
    Byte,
    Bit,
}

/// Zero padding up to an alignment boundary in bytes.
#[derive(Debug, Deserialize)]
pub struct PaddingType {
    pub align: usize,
}

#[derive(Debug, Deserialize)]
pub struct TypeRefType {
    /// Name of the referenced type. (Keyed `target` so it cannot collide
    /// with the field's own `name` key under flattening.)
    pub target: String,
}

/// Pointer into the already-written portion of the same message (DNS-style
/// label compression).
#[derive(Debug, Deserialize)]
pub struct BackReferenceType {
    /// Named type the reference resolves to.
    pub target: String,
    /// Storage integer holding either the marker+offset or nothing (the
    /// target is then inline at the current position).
    pub storage: IntegerType,
    /// Low bits of the storage integer that carry the offset; the remaining
    /// high bits are the pointer marker.
    pub mask: u64,
    #[serde(default)]
    pub origin: OffsetOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetOrigin {
    #[default]
    MessageStart,
    CurrentPosition,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceType {
    /// Variant type names, attempted in order at decode.
    pub variants: Vec<String>,
}

/// Literal for a `const` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConstValue {
    Uint(u64),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Derivation rule for a `computed` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComputedSpec {
    /// Byte length of the target; with `from_after_field`, the byte length
    /// of everything in the sequence after the named field (content-first
    /// two-pass encoding).
    LengthOf {
        target: String,
        #[serde(default)]
        from_after_field: Option<String>,
    },
    /// Element count of the target array.
    CountOf { target: String },
    /// CRC-32 of the encoded bytes of the target; with `through`, of the
    /// contiguous run of sibling fields from `target` to `through`
    /// inclusive (PNG chunks checksum the type tag together with the
    /// payload).
    Crc32Of {
        target: String,
        #[serde(default)]
        through: Option<String>,
    },
    /// Byte offset of the target from the start of the message.
    PositionOf { target: String },
    /// Sum of the byte lengths of the listed targets.
    SumOfSizes { targets: Vec<String> },
    /// Sum of the encoded sizes of a given variant type's elements in an
    /// array.
    SumOfTypeSizes { array: String, type_name: String },
}

impl ComputedSpec {
    /// All raw target paths this spec references.
    pub fn raw_targets(&self) -> Vec<&str> {
        match self {
            ComputedSpec::LengthOf { target, .. }
            | ComputedSpec::CountOf { target }
            | ComputedSpec::Crc32Of { target, .. }
            | ComputedSpec::PositionOf { target } => vec![target.as_str()],
            ComputedSpec::SumOfSizes { targets } => {
                targets.iter().map(String::as_str).collect()
            }
            ComputedSpec::SumOfTypeSizes { array, .. } => vec![array.as_str()],
        }
    }
}

/// Presence predicate for conditional fields. `field` may climb frames with
/// `../` prefixes.
#[derive(Debug, Clone, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: CompareOp,
    pub value: u64,
}

/// A parsed computed-target path: optional `../` ascents, a field name, and
/// an optional array selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    pub ascend: usize,
    pub field: String,
    pub selector: Option<Selector>,
}

/// Bracketed suffix identifying one element of an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// First element of the named variant type.
    First(String),
    /// Last element of the named variant type.
    Last(String),
    /// The element of the named variant type that correlates 1:1 with the
    /// current encoding iteration.
    Corresponding(String),
}

impl TargetPath {
    pub fn parse(raw: &str) -> Result<Self, SchemaError> {
        let mut rest = raw;
        let mut ascend = 0;
        while let Some(stripped) = rest.strip_prefix("../") {
            ascend += 1;
            rest = stripped;
        }
        if rest.is_empty() || rest.contains("../") {
            return Err(SchemaError::InvalidTargetPath(raw.to_string()));
        }

        let (field, selector) = match rest.find('[') {
            None => (rest.to_string(), None),
            Some(open) => {
                let inner = rest[open..]
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .ok_or_else(|| SchemaError::InvalidTargetPath(raw.to_string()))?;
                let selector = Selector::parse(inner)
                    .ok_or_else(|| SchemaError::InvalidTargetPath(raw.to_string()))?;
                (rest[..open].to_string(), Some(selector))
            }
        };
        if field.is_empty() {
            return Err(SchemaError::InvalidTargetPath(raw.to_string()));
        }
        Ok(TargetPath {
            ascend,
            field,
            selector,
        })
    }

    /// Whether resolving this path requires an encoding context (ancestor
    /// frame or selector).
    pub fn needs_context(&self) -> bool {
        self.ascend > 0 || self.selector.is_some()
    }
}

impl Selector {
    fn parse(inner: &str) -> Option<Self> {
        let (kind, rest) = inner.split_once('<')?;
        let type_name = rest.strip_suffix('>')?;
        if type_name.is_empty() {
            return None;
        }
        match kind {
            "first" => Some(Selector::First(type_name.to_string())),
            "last" => Some(Selector::Last(type_name.to_string())),
            "corresponding" => Some(Selector::Corresponding(type_name.to_string())),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Selector::First(name) | Selector::Last(name) | Selector::Corresponding(name) => name,
        }
    }
}

/// Errors raised while parsing or validating a schema document.
#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("type '{referenced}' referenced by '{referrer}' is not defined")]
    UndefinedType {
        referenced: String,
        referrer: String,
    },
    #[error("type cycle detected: {0}")]
    CircularReference(String),
    #[error("field '{field}' of type '{type_name}': {reason}")]
    InvalidField {
        type_name: String,
        field: String,
        reason: String,
    },
    #[error("invalid computed target path '{0}'")]
    InvalidTargetPath(String),
    #[error("unsupported schema construct: {0}")]
    Unsupported(String),
}

impl Schema {
    pub fn from_yaml(content: &str) -> Result<Self, SchemaError> {
        let schema: Schema = serde_yaml::from_str(content)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Follows alias chains until a non-alias definition or a terminal wire
    /// shape. Returns the final named type when the chain ends in a
    /// composite or union.
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> Option<(&'a str, &'a TypeDef)> {
        let mut current = name;
        loop {
            match self.types.get(current)? {
                TypeDef::Alias(alias) => match &alias.value {
                    FieldType::TypeRef(type_ref) => current = &type_ref.target,
                    _ => return Some((current, self.types.get(current).unwrap())),
                },
                def => return Some((current, def)),
            }
        }
    }

    fn validate(&self) -> Result<(), SchemaError> {
        for (type_name, def) in &self.types {
            match def {
                TypeDef::Composite(composite) => {
                    for field in &composite.sequence {
                        self.validate_field(type_name, field)?;
                    }
                    for instance in &composite.instances {
                        self.validate_field_type(type_name, &instance.name, &instance.ty)?;
                    }
                }
                TypeDef::Alias(alias) => {
                    self.validate_field_type(type_name, "<alias value>", &alias.value)?;
                }
                TypeDef::Union(union) => {
                    if union.variants.is_empty() {
                        return Err(SchemaError::InvalidField {
                            type_name: type_name.clone(),
                            field: "<variants>".into(),
                            reason: "union has no variants".into(),
                        });
                    }
                    for variant in &union.variants {
                        self.require_type(type_name, &variant.type_name)?;
                    }
                }
            }
        }

        self.check_alias_cycles()?;
        self.check_inline_cycles()?;
        Ok(())
    }

    fn validate_field(&self, type_name: &str, field: &Field) -> Result<(), SchemaError> {
        if field.const_value.is_some() && field.computed.is_some() {
            return Err(SchemaError::InvalidField {
                type_name: type_name.to_string(),
                field: field.name.clone(),
                reason: "a field cannot be both const and computed".into(),
            });
        }
        if let Some(computed) = &field.computed {
            for raw in computed.raw_targets() {
                TargetPath::parse(raw)?;
            }
        }
        self.validate_field_type(type_name, &field.name, &field.ty)
    }

    fn validate_field_type(
        &self,
        type_name: &str,
        field_name: &str,
        ty: &FieldType,
    ) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidField {
            type_name: type_name.to_string(),
            field: field_name.to_string(),
            reason,
        };

        match ty {
            FieldType::Uint(int) | FieldType::Int(int) => {
                if !matches!(int.width, 8 | 16 | 32 | 64) {
                    return Err(invalid(format!("invalid integer width {}", int.width)));
                }
            }
            FieldType::Float(float) => {
                if !matches!(float.width, 32 | 64) {
                    return Err(invalid(format!("invalid float width {}", float.width)));
                }
            }
            FieldType::Bits(bits) => {
                if bits.width == 0 || bits.width > 64 {
                    return Err(invalid(format!("invalid bit width {}", bits.width)));
                }
                if !bits.subfields.is_empty() {
                    let total: u32 = bits.subfields.iter().map(|sub| sub.width).sum();
                    if total != bits.width {
                        return Err(invalid(format!(
                            "subfield widths sum to {total}, field is {} bits",
                            bits.width
                        )));
                    }
                }
            }
            FieldType::Varlength(_) => {}
            FieldType::String(string) => match string.kind {
                StringKind::LengthPrefixed => {
                    if string.prefix.is_none() {
                        return Err(invalid("length_prefixed string requires a prefix".into()));
                    }
                }
                StringKind::Fixed => {
                    if string.length.is_none() {
                        return Err(invalid("fixed string requires a length".into()));
                    }
                }
                StringKind::FieldReferenced => {
                    if string.length_field.is_none() {
                        return Err(invalid(
                            "field_referenced string requires a length_field".into(),
                        ));
                    }
                }
                StringKind::NullTerminated => {}
            },
            FieldType::Array(array) => {
                match array.kind {
                    ArrayKind::LengthPrefixed
                    | ArrayKind::ByteLengthPrefixed
                    | ArrayKind::LengthPrefixedItems => {
                        if array.prefix.is_none() {
                            return Err(invalid(format!(
                                "{:?} array requires a prefix",
                                array.kind
                            )));
                        }
                    }
                    ArrayKind::Fixed => {
                        if array.count.is_none() {
                            return Err(invalid("fixed array requires a count".into()));
                        }
                    }
                    ArrayKind::FieldReferenced
                    | ArrayKind::ByteBudgeted
                    | ArrayKind::ComputedCount => {
                        if array.length_field.is_none() {
                            return Err(invalid(format!(
                                "{:?} array requires a length_field",
                                array.kind
                            )));
                        }
                    }
                    ArrayKind::VariantTerminated => {
                        if array.terminator.is_none() {
                            return Err(invalid(
                                "variant_terminated array requires a terminator".into(),
                            ));
                        }
                    }
                    ArrayKind::SignatureTerminated => {
                        if array.signature.as_ref().map_or(true, Vec::is_empty) {
                            return Err(invalid(
                                "signature_terminated array requires a non-empty signature".into(),
                            ));
                        }
                    }
                    ArrayKind::NullTerminated | ArrayKind::EofTerminated => {}
                }
                self.validate_field_type(type_name, field_name, &array.items)?;
            }
            FieldType::Optional(optional) => {
                self.validate_field_type(type_name, field_name, &optional.value)?;
            }
            FieldType::Padding(padding) => {
                if padding.align == 0 {
                    return Err(invalid("padding alignment must be non-zero".into()));
                }
            }
            FieldType::TypeRef(type_ref) => {
                self.require_type(type_name, &type_ref.target)?;
            }
            FieldType::BackReference(back_ref) => {
                self.require_type(type_name, &back_ref.target)?;
                if !matches!(back_ref.storage.width, 8 | 16 | 32 | 64) {
                    return Err(invalid(format!(
                        "invalid back-reference storage width {}",
                        back_ref.storage.width
                    )));
                }
                if back_ref.mask == 0 || back_ref.mask >= width_mask(back_ref.storage.width) {
                    return Err(invalid(format!(
                        "back-reference mask {:#x} leaves no marker bits",
                        back_ref.mask
                    )));
                }
            }
            FieldType::Choice(choice) => {
                if choice.variants.is_empty() {
                    return Err(invalid("choice has no variants".into()));
                }
                for variant in &choice.variants {
                    self.require_type(type_name, variant)?;
                }
            }
        }
        Ok(())
    }

    fn require_type(&self, referrer: &str, referenced: &str) -> Result<(), SchemaError> {
        if self.types.contains_key(referenced) {
            Ok(())
        } else {
            Err(SchemaError::UndefinedType {
                referenced: referenced.to_string(),
                referrer: referrer.to_string(),
            })
        }
    }

    fn check_alias_cycles(&self) -> Result<(), SchemaError> {
        for name in self.types.keys() {
            let mut chain = vec![name.as_str()];
            let mut current = name.as_str();
            while let Some(TypeDef::Alias(alias)) = self.types.get(current) {
                let FieldType::TypeRef(type_ref) = &alias.value else {
                    break;
                };
                current = &type_ref.target;
                if chain.contains(&current) {
                    chain.push(current);
                    return Err(SchemaError::CircularReference(chain.join(" -> ")));
                }
                chain.push(current);
            }
        }
        Ok(())
    }

    /// A type that contains itself through a path with no array or optional
    /// indirection would have infinite size; reject it.
    fn check_inline_cycles(&self) -> Result<(), SchemaError> {
        for name in self.types.keys() {
            let mut stack = vec![name.as_str()];
            self.walk_inline(name, name, &mut stack)?;
        }
        Ok(())
    }

    fn walk_inline<'a>(
        &'a self,
        origin: &str,
        current: &'a str,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), SchemaError> {
        let mut visit = |target: &'a str, stack: &mut Vec<&'a str>| -> Result<(), SchemaError> {
            if stack.contains(&target) {
                if target == origin {
                    let mut chain = stack.clone();
                    chain.push(target);
                    return Err(SchemaError::CircularReference(chain.join(" -> ")));
                }
                return Ok(());
            }
            stack.push(target);
            self.walk_inline(origin, target, stack)?;
            stack.pop();
            Ok(())
        };

        match self.types.get(current) {
            Some(TypeDef::Composite(composite)) => {
                for field in &composite.sequence {
                    for target in inline_refs(&field.ty) {
                        visit(target, stack)?;
                    }
                }
            }
            Some(TypeDef::Alias(alias)) => {
                for target in inline_refs(&alias.value) {
                    visit(target, stack)?;
                }
            }
            Some(TypeDef::Union(union)) => {
                for variant in &union.variants {
                    visit(&variant.type_name, stack)?;
                }
            }
            None => {}
        }
        Ok(())
    }
}

/// Type names reachable from `ty` without passing through an array,
/// optional, or back-reference (the paths that would make a self-reference
/// infinitely sized).
fn inline_refs(ty: &FieldType) -> Vec<&str> {
    match ty {
        FieldType::TypeRef(type_ref) => vec![type_ref.target.as_str()],
        FieldType::Choice(choice) => choice.variants.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}

/// All-ones value of the given bit width.
pub fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Pre-order walk over a field type and its nested element/value types.
pub fn walk_field_type<'a>(ty: &'a FieldType, visit: &mut impl FnMut(&'a FieldType)) {
    visit(ty);
    match ty {
        FieldType::Array(array) => walk_field_type(&array.items, visit),
        FieldType::Optional(optional) => walk_field_type(&optional.value, visit),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Helper macro for testing schema parsing
    macro_rules! test_schema {
        ($yaml:expr, $test_fn:expr) => {
            let schema = Schema::from_yaml($yaml).unwrap();
            $test_fn(schema);
        };
    }

    mod config_tests {
        use super::*;

        #[test]
        fn defaults_are_big_endian_msb_first() {
            let yaml = r#"
                types: {}
            "#;
            test_schema!(yaml, |schema: Schema| {
                assert_eq!(schema.config.endianness, ByteOrder::Big);
                assert_eq!(schema.config.bit_order, BitOrder::MsbFirst);
            });
        }

        #[test]
        fn explicit_config() {
            let yaml = r#"
                config:
                  endianness: little
                  bit_order: lsb_first
                types: {}
            "#;
            test_schema!(yaml, |schema: Schema| {
                assert_eq!(schema.config.endianness, ByteOrder::Little);
                assert_eq!(schema.config.bit_order, BitOrder::LsbFirst);
            });
        }
    }

    mod field_tests {
        use super::*;

        #[test]
        fn composite_with_const_and_computed() {
            let yaml = r#"
                types:
                  chunk:
                    kind: composite
                    sequence:
                      - name: magic
                        type: uint
                        width: 32
                        const: 0x04034b50
                      - name: len_body
                        type: uint
                        width: 32
                        computed:
                          kind: length_of
                          target: body
                      - name: body
                        type: array
                        kind: field_referenced
                        length_field: len_body
                        items:
                          type: uint
                          width: 8
            "#;
            test_schema!(yaml, |schema: Schema| {
                let TypeDef::Composite(chunk) = schema.get("chunk").unwrap() else {
                    panic!("expected composite");
                };
                assert_eq!(chunk.sequence.len(), 3);
                assert_eq!(
                    chunk.sequence[0].const_value,
                    Some(ConstValue::Uint(0x04034b50))
                );
                assert!(matches!(
                    chunk.sequence[1].computed,
                    Some(ComputedSpec::LengthOf { .. })
                ));
                let FieldType::Array(array) = &chunk.sequence[2].ty else {
                    panic!("expected array");
                };
                assert_eq!(array.kind, ArrayKind::FieldReferenced);
                assert_eq!(array.length_field.as_deref(), Some("len_body"));
            });
        }

        #[test]
        fn endianness_override_flows_to_the_wire_type() {
            let yaml = r#"
                types:
                  header:
                    kind: composite
                    sequence:
                      - name: tag
                        type: uint
                        width: 16
                        endianness: little
            "#;
            test_schema!(yaml, |schema: Schema| {
                let TypeDef::Composite(header) = schema.get("header").unwrap() else {
                    panic!("expected composite");
                };
                let FieldType::Uint(int) = &header.sequence[0].ty else {
                    panic!("expected uint");
                };
                assert_eq!(int.endianness, Some(ByteOrder::Little));
            });
        }

        #[test]
        fn union_with_peek_discriminator() {
            let yaml = r#"
                types:
                  a:
                    kind: composite
                    sequence: []
                  b:
                    kind: composite
                    sequence: []
                  message:
                    kind: union
                    discriminator:
                      kind: peek
                      int: { width: 8 }
                    variants:
                      - type_name: a
                        when: { op: eq, value: 1 }
                      - type_name: b
            "#;
            test_schema!(yaml, |schema: Schema| {
                let TypeDef::Union(union) = schema.get("message").unwrap() else {
                    panic!("expected union");
                };
                assert!(matches!(union.discriminator, Discriminator::Peek { .. }));
                assert!(union.variants[0].when.is_some());
                assert!(union.variants[1].when.is_none());
            });
        }

        #[test]
        fn back_reference_field() {
            let yaml = r#"
                types:
                  label_seq:
                    kind: composite
                    sequence: []
                  name:
                    kind: alias
                    value:
                      type: back_reference
                      target: label_seq
                      storage: { width: 16 }
                      mask: 0x3FFF
            "#;
            test_schema!(yaml, |schema: Schema| {
                let TypeDef::Alias(alias) = schema.get("name").unwrap() else {
                    panic!("expected alias");
                };
                let FieldType::BackReference(back_ref) = &alias.value else {
                    panic!("expected back_reference");
                };
                assert_eq!(back_ref.target, "label_seq");
                assert_eq!(back_ref.mask, 0x3FFF);
                assert_eq!(back_ref.origin, OffsetOrigin::MessageStart);
            });
        }

        #[test]
        fn instance_fields_parse() {
            let yaml = r#"
                types:
                  record:
                    kind: composite
                    sequence:
                      - name: ofs_extra
                        type: uint
                        width: 16
                    instances:
                      - name: extra
                        type: uint
                        width: 32
                        offset: ofs_extra
                      - name: trailer
                        type: uint
                        width: 16
                        offset: -2
            "#;
            test_schema!(yaml, |schema: Schema| {
                let TypeDef::Composite(record) = schema.get("record").unwrap() else {
                    panic!("expected composite");
                };
                assert_eq!(record.instances.len(), 2);
                assert!(matches!(
                    record.instances[0].offset,
                    InstanceOffset::FieldRef(ref name) if name == "ofs_extra"
                ));
                assert!(matches!(record.instances[1].offset, InstanceOffset::Fixed(-2)));
            });
        }
    }

    mod target_path_tests {
        use super::*;

        #[test]
        fn plain_field() {
            let path = TargetPath::parse("body").unwrap();
            assert_eq!(path.ascend, 0);
            assert_eq!(path.field, "body");
            assert!(path.selector.is_none());
            assert!(!path.needs_context());
        }

        #[test]
        fn ancestor_levels() {
            let path = TargetPath::parse("../../payload").unwrap();
            assert_eq!(path.ascend, 2);
            assert_eq!(path.field, "payload");
            assert!(path.needs_context());
        }

        #[test]
        fn selectors() {
            let path = TargetPath::parse("sections[first<central_dir_entry>]").unwrap();
            assert_eq!(path.field, "sections");
            assert_eq!(
                path.selector,
                Some(Selector::First("central_dir_entry".into()))
            );

            let path = TargetPath::parse("sections[corresponding<local_file>]").unwrap();
            assert_eq!(
                path.selector,
                Some(Selector::Corresponding("local_file".into()))
            );
            assert!(path.needs_context());
        }

        #[test]
        fn malformed_paths_are_rejected() {
            assert!(TargetPath::parse("").is_err());
            assert!(TargetPath::parse("../").is_err());
            assert!(TargetPath::parse("a[first<>]").is_err());
            assert!(TargetPath::parse("a[middle<T>]").is_err());
            assert!(TargetPath::parse("a[first<T>").is_err());
        }
    }

    mod validation_tests {
        use super::*;

        #[test]
        fn undefined_type_reference() {
            let yaml = r#"
                types:
                  record:
                    kind: composite
                    sequence:
                      - name: inner
                        type: type_ref
                        target: missing
            "#;
            match Schema::from_yaml(yaml) {
                Err(SchemaError::UndefinedType { referenced, .. }) => {
                    assert_eq!(referenced, "missing");
                }
                other => panic!("expected undefined-type error, got {other:?}"),
            }
        }

        #[test]
        fn alias_cycle() {
            let yaml = r#"
                types:
                  a:
                    kind: alias
                    value: { type: type_ref, target: b }
                  b:
                    kind: alias
                    value: { type: type_ref, target: a }
            "#;
            assert!(matches!(
                Schema::from_yaml(yaml),
                Err(SchemaError::CircularReference(_))
            ));
        }

        #[test]
        fn inline_self_reference() {
            let yaml = r#"
                types:
                  node:
                    kind: composite
                    sequence:
                      - name: next
                        type: type_ref
                        target: node
            "#;
            assert!(matches!(
                Schema::from_yaml(yaml),
                Err(SchemaError::CircularReference(_))
            ));
        }

        #[test]
        fn self_reference_through_array_is_fine() {
            let yaml = r#"
                types:
                  node:
                    kind: composite
                    sequence:
                      - name: children
                        type: array
                        kind: length_prefixed
                        prefix: { width: 8 }
                        items:
                          type: type_ref
                          target: node
            "#;
            assert!(Schema::from_yaml(yaml).is_ok());
        }

        #[test]
        fn const_and_computed_conflict() {
            let yaml = r#"
                types:
                  record:
                    kind: composite
                    sequence:
                      - name: len
                        type: uint
                        width: 8
                        const: 1
                        computed: { kind: count_of, target: len }
            "#;
            assert!(matches!(
                Schema::from_yaml(yaml),
                Err(SchemaError::InvalidField { .. })
            ));
        }

        #[test]
        fn array_kind_knob_checks() {
            let yaml = r#"
                types:
                  record:
                    kind: composite
                    sequence:
                      - name: items
                        type: array
                        kind: fixed
                        items: { type: uint, width: 8 }
            "#;
            assert!(matches!(
                Schema::from_yaml(yaml),
                Err(SchemaError::InvalidField { .. })
            ));
        }

        #[test]
        fn bad_integer_width() {
            let yaml = r#"
                types:
                  record:
                    kind: composite
                    sequence:
                      - name: x
                        type: uint
                        width: 24
            "#;
            assert!(matches!(
                Schema::from_yaml(yaml),
                Err(SchemaError::InvalidField { .. })
            ));
        }

        #[test]
        fn bit_subfield_widths_must_sum() {
            let yaml = r#"
                types:
                  record:
                    kind: composite
                    sequence:
                      - name: flags
                        type: bits
                        width: 8
                        subfields:
                          - { name: qr, width: 1 }
                          - { name: opcode, width: 4 }
            "#;
            assert!(matches!(
                Schema::from_yaml(yaml),
                Err(SchemaError::InvalidField { .. })
            ));
        }
    }

    mod alias_tests {
        use super::*;

        #[test]
        fn alias_chains_resolve() {
            let yaml = r#"
                types:
                  record:
                    kind: composite
                    sequence: []
                  rec2:
                    kind: alias
                    value: { type: type_ref, target: record }
                  rec3:
                    kind: alias
                    value: { type: type_ref, target: rec2 }
            "#;
            test_schema!(yaml, |schema: Schema| {
                let (name, def) = schema.resolve_alias("rec3").unwrap();
                assert_eq!(name, "record");
                assert!(matches!(def, TypeDef::Composite(_)));
            });
        }
    }
}
