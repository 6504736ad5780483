//! Emits per-type Rust encode/decode routines from an analyzed schema.
//!
//! The generator walks the annotated IR in declaration order and produces
//! one self-contained module as a `String`. Generated code depends only on
//! [`crate::runtime`]; the compiler itself performs no I/O.

pub mod builder;
pub mod names;

mod computed;
mod decoder;
mod encoder;
mod types;

use builder::CodeBuilder;

use crate::analyzer::{analyze, SchemaFacts};
use crate::runtime::bitstream::{BitOrder, ByteOrder};
use crate::runtime::varlength::VarlengthEncoding;
use crate::schema::{ArrayKind, FieldType, IntegerType, Schema, SchemaError, TypeDef};

/// Drives code emission for one schema.
pub struct Generator<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) facts: SchemaFacts,
    runtime_path: String,
}

impl<'a> Generator<'a> {
    /// Analyzes the schema and prepares a generator. Fails on anything the
    /// analyzer refuses to compile.
    pub fn new(schema: &'a Schema) -> Result<Self, SchemaError> {
        let facts = analyze(schema)?;
        Ok(Self {
            schema,
            facts,
            runtime_path: "binschema::runtime".to_string(),
        })
    }

    /// Overrides the path generated `use` items resolve the runtime through
    /// (the default is `binschema::runtime`).
    pub fn with_runtime_path(mut self, path: impl Into<String>) -> Self {
        self.runtime_path = path.into();
        self
    }

    /// Classification computed for the schema, in declaration order.
    pub fn facts(&self) -> &SchemaFacts {
        &self.facts
    }

    /// Emits the complete generated module.
    pub fn generate(&self) -> Result<String, SchemaError> {
        let mut b = CodeBuilder::new();

        b.line("//! Generated by binschema. Do not edit by hand.");
        b.line("#![allow(unused_imports, unused_mut, unused_parens, unused_variables, clippy::all)]");
        b.blank();
        b.line(format!("use {}::{{", self.runtime_path));
        b.indent();
        b.line("crc32, BitOrder, BitStreamDecoder, BitStreamEncoder, ByteOrder, CodecError,");
        b.line("CodecResult, DecodeContext, EncodeContext, FieldMap, FieldValue, ItemEntry,");
        b.line("VarlengthEncoding,");
        b.dedent();
        b.line("};");
        b.blank();

        for (schema_name, def) in &self.schema.types {
            match def {
                TypeDef::Composite(composite) => {
                    self.emit_choice_enums(&mut b, schema_name, composite)?;
                    self.emit_composite_defs(&mut b, schema_name, composite)?;
                    self.emit_composite_encode(&mut b, schema_name, composite)?;
                    self.emit_composite_decode(&mut b, schema_name, composite)?;
                }
                TypeDef::Union(union) => {
                    self.emit_union_def(&mut b, schema_name, union)?;
                    self.emit_union_encode(&mut b, schema_name, union)?;
                    self.emit_union_decode(&mut b, schema_name, union)?;
                }
                // Aliases are resolved structurally at their use sites and
                // emit no definitions of their own.
                TypeDef::Alias(_) => {}
            }
        }

        Ok(b.into_string())
    }
}

/// View of a split type the emitted code is being generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum View {
    Input,
    Output,
}

/// Where a field-type reference bottoms out after alias resolution.
pub(crate) enum ResolvedShape<'s> {
    /// A wire shape to handle inline.
    Inline(&'s FieldType),
    /// A named composite or union with emitted definitions.
    Named {
        schema_name: &'s str,
        def: &'s TypeDef,
    },
}

impl Generator<'_> {
    /// Follows type references and alias chains to the shape codegen must
    /// emit for.
    pub(crate) fn resolve_shape<'s>(
        &'s self,
        ty: &'s FieldType,
    ) -> Result<ResolvedShape<'s>, SchemaError> {
        match ty {
            FieldType::TypeRef(type_ref) => {
                let (schema_name, def) =
                    self.schema
                        .resolve_alias(&type_ref.target)
                        .ok_or_else(|| SchemaError::UndefinedType {
                            referenced: type_ref.target.clone(),
                            referrer: "<codegen>".into(),
                        })?;
                match def {
                    TypeDef::Alias(alias) => self.resolve_shape(&alias.value),
                    _ => Ok(ResolvedShape::Named { schema_name, def }),
                }
            }
            _ => Ok(ResolvedShape::Inline(ty)),
        }
    }

    /// The emitted Rust type name for a named schema type under a view.
    pub(crate) fn view_type_name(&self, schema_name: &str, view: View) -> String {
        let base = names::type_name(schema_name);
        if self.facts.get(schema_name).split_views {
            match view {
                View::Input => format!("{base}Input"),
                View::Output => format!("{base}Output"),
            }
        } else {
            base
        }
    }

    /// The emitted enum name for an inline choice field.
    pub(crate) fn choice_enum_name(
        &self,
        owner: &str,
        field_name: &str,
        variants: &[String],
        view: View,
    ) -> String {
        let base = format!(
            "{}{}",
            names::type_name(owner),
            names::type_name(field_name)
        );
        if self.choice_splits(variants) {
            match view {
                View::Input => format!("{base}Input"),
                View::Output => format!("{base}Output"),
            }
        } else {
            base
        }
    }

    /// A choice splits into views iff any variant's payload splits.
    pub(crate) fn choice_splits(&self, variants: &[String]) -> bool {
        variants.iter().any(|variant| {
            self.schema
                .resolve_alias(variant)
                .map_or(false, |(resolved, _)| self.facts.get(resolved).split_views)
        })
    }

    /// Byte-order expression for an integer/float field, honoring the
    /// per-field override.
    pub(crate) fn order_expr(&self, override_order: Option<ByteOrder>) -> &'static str {
        match override_order.unwrap_or(self.schema.config.endianness) {
            ByteOrder::Big => "ByteOrder::Big",
            ByteOrder::Little => "ByteOrder::Little",
        }
    }

    /// Bit-order expression for stream construction.
    pub(crate) fn bit_order_expr(&self) -> &'static str {
        match self.schema.config.bit_order {
            BitOrder::MsbFirst => "BitOrder::MsbFirst",
            BitOrder::LsbFirst => "BitOrder::LsbFirst",
        }
    }

    /// The Rust type a wire shape maps to under a view.
    pub(crate) fn rust_type_of(
        &self,
        owner: &str,
        field_name: &str,
        ty: &FieldType,
        view: View,
    ) -> Result<String, SchemaError> {
        Ok(match ty {
            FieldType::Uint(int) => uint_type(int.width).to_string(),
            FieldType::Int(int) => int_type(int.width).to_string(),
            FieldType::Float(float) => {
                if float.width == 32 {
                    "f32".into()
                } else {
                    "f64".into()
                }
            }
            FieldType::Bits(bits) => uint_for_bit_width(bits.width).to_string(),
            FieldType::Varlength(_) => "u64".into(),
            FieldType::String(_) => "String".into(),
            FieldType::Array(array) => {
                if is_byte_item(&array.items) {
                    "Vec<u8>".into()
                } else {
                    format!(
                        "Vec<{}>",
                        self.rust_type_of(owner, field_name, &array.items, view)?
                    )
                }
            }
            FieldType::Optional(optional) => format!(
                "Option<{}>",
                self.rust_type_of(owner, field_name, &optional.value, view)?
            ),
            FieldType::Padding(_) => {
                return Err(SchemaError::Unsupported(format!(
                    "padding has no value type ('{field_name}' in '{owner}')"
                )))
            }
            FieldType::TypeRef(_) => match self.resolve_shape(ty)? {
                ResolvedShape::Inline(inner) => {
                    self.rust_type_of(owner, field_name, inner, view)?
                }
                ResolvedShape::Named { schema_name, .. } => {
                    self.view_type_name(schema_name, view)
                }
            },
            FieldType::BackReference(back_ref) => {
                let (schema_name, _) = self
                    .schema
                    .resolve_alias(&back_ref.target)
                    .ok_or_else(|| SchemaError::UndefinedType {
                        referenced: back_ref.target.clone(),
                        referrer: owner.to_string(),
                    })?;
                self.view_type_name(schema_name, view)
            }
            FieldType::Choice(choice) => {
                self.choice_enum_name(owner, field_name, &choice.variants, view)
            }
        })
    }
}

/// Whether array items are plain bytes (emitted as `Vec<u8>`).
pub(crate) fn is_byte_item(ty: &FieldType) -> bool {
    matches!(ty, FieldType::Uint(int) if int.width == 8)
}

/// Whether a wire shape's Rust value is `Copy` (affects loop bindings and
/// snapshot construction).
pub(crate) fn is_copy_shape(ty: &FieldType) -> bool {
    matches!(
        ty,
        FieldType::Uint(_)
            | FieldType::Int(_)
            | FieldType::Float(_)
            | FieldType::Bits(_)
            | FieldType::Varlength(_)
    )
}

pub(crate) fn uint_type(width: u32) -> &'static str {
    match width {
        8 => "u8",
        16 => "u16",
        32 => "u32",
        _ => "u64",
    }
}

pub(crate) fn int_type(width: u32) -> &'static str {
    match width {
        8 => "i8",
        16 => "i16",
        32 => "i32",
        _ => "i64",
    }
}

/// Narrowest unsigned type that holds a bit-granular field.
pub(crate) fn uint_for_bit_width(width: u32) -> &'static str {
    if width <= 8 {
        "u8"
    } else if width <= 16 {
        "u16"
    } else if width <= 32 {
        "u32"
    } else {
        "u64"
    }
}

pub(crate) fn varlength_expr(encoding: VarlengthEncoding) -> &'static str {
    match encoding {
        VarlengthEncoding::Der => "VarlengthEncoding::Der",
        VarlengthEncoding::Leb128 => "VarlengthEncoding::Leb128",
        VarlengthEncoding::Vlq => "VarlengthEncoding::Vlq",
    }
}

/// Static byte size of an array's leading frame, used by position
/// pre-passes to project the first item's offset.
pub(crate) fn array_leading_bytes(kind: ArrayKind, prefix: Option<&IntegerType>) -> usize {
    match kind {
        ArrayKind::LengthPrefixed | ArrayKind::ByteLengthPrefixed => {
            prefix.map_or(0, |int| int.width as usize / 8)
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_schema() -> Schema {
        Schema::from_yaml(
            r#"
            types:
              point:
                kind: composite
                sequence:
                  - { name: x, type: uint, width: 16 }
                  - { name: y, type: int, width: 16, endianness: little }
            "#,
        )
        .unwrap()
    }

    #[test]
    fn unified_type_gets_a_single_struct() {
        let schema = point_schema();
        let source = Generator::new(&schema).unwrap().generate().unwrap();

        assert!(source.contains("pub struct Point {"));
        assert!(!source.contains("PointInput"));
        assert!(source.contains("stream.write_u16(self.x, ByteOrder::Big)?;"));
        assert!(source.contains("stream.write_i16(self.y, ByteOrder::Little)?;"));
        assert!(source.contains("let y = stream.read_i16(ByteOrder::Little)?;"));
    }

    #[test]
    fn runtime_path_override() {
        let schema = point_schema();
        let source = Generator::new(&schema)
            .unwrap()
            .with_runtime_path("crate::runtime")
            .generate()
            .unwrap();
        assert!(source.contains("use crate::runtime::{"));
        assert!(!source.contains("use binschema::runtime::{"));
    }

    #[test]
    fn aliases_emit_no_definitions_of_their_own() {
        let schema = Schema::from_yaml(
            r#"
            types:
              point:
                kind: composite
                sequence:
                  - { name: x, type: uint, width: 8 }
              spot:
                kind: alias
                value: { type: type_ref, target: point }
            "#,
        )
        .unwrap();
        let source = Generator::new(&schema).unwrap().generate().unwrap();
        assert!(source.contains("pub struct Point {"));
        assert!(!source.contains("Spot"));
    }

    #[test]
    fn generation_is_deterministic() {
        let schema = point_schema();
        let first = Generator::new(&schema).unwrap().generate().unwrap();
        let second = Generator::new(&schema).unwrap().generate().unwrap();
        assert_eq!(first, second);
    }
}

