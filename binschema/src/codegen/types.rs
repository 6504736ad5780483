//! Emission of per-type struct/enum definitions, the Input/Output view
//! split, and the total `Output -> Input` conversions.

use super::builder::CodeBuilder;
use super::names::{field_ident, type_name};
use super::{Generator, ResolvedShape, View};
use crate::schema::{
    walk_field_type, ChoiceType, CompositeType, Field, FieldType, SchemaError, UnionType,
};

impl Generator<'_> {
    /// Emits the enum definitions for every inline choice field of a
    /// composite, ahead of the structs that use them.
    pub(crate) fn emit_choice_enums(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
    ) -> Result<(), SchemaError> {
        let mut seen: Vec<&str> = Vec::new();
        let mut found: Vec<(&str, &ChoiceType)> = Vec::new();

        for field in &composite.sequence {
            collect_choices(&field.name, &field.ty, &mut seen, &mut found)?;
        }
        for instance in &composite.instances {
            collect_choices(&instance.name, &instance.ty, &mut seen, &mut found)?;
        }

        for (field_name, choice) in found {
            let splits = self.choice_splits(&choice.variants);
            let views: &[View] = if splits {
                &[View::Input, View::Output]
            } else {
                &[View::Output]
            };
            for view in views {
                let enum_name = self.choice_enum_name(owner, field_name, &choice.variants, *view);
                b.line("#[derive(Debug, Clone, PartialEq)]");
                b.open(format!("pub enum {enum_name}"));
                for variant in &choice.variants {
                    let (resolved, _) = self.schema.resolve_alias(variant).ok_or_else(|| {
                        SchemaError::UndefinedType {
                            referenced: variant.clone(),
                            referrer: owner.to_string(),
                        }
                    })?;
                    b.line(format!(
                        "{}({}),",
                        type_name(variant),
                        self.view_type_name(resolved, *view)
                    ));
                }
                b.close();
                b.blank();
            }

            if splits {
                let output_name =
                    self.choice_enum_name(owner, field_name, &choice.variants, View::Output);
                let input_name =
                    self.choice_enum_name(owner, field_name, &choice.variants, View::Input);
                b.open(format!("impl From<{output_name}> for {input_name}"));
                b.open(format!("fn from(output: {output_name}) -> Self"));
                b.open("match output");
                for variant in &choice.variants {
                    let variant_ident = type_name(variant);
                    let (resolved, _) = self.schema.resolve_alias(variant).unwrap();
                    if self.facts.get(resolved).split_views {
                        b.line(format!(
                            "{output_name}::{variant_ident}(v) => Self::{variant_ident}(v.into()),"
                        ));
                    } else {
                        b.line(format!(
                            "{output_name}::{variant_ident}(v) => Self::{variant_ident}(v),"
                        ));
                    }
                }
                b.close();
                b.close();
                b.close();
                b.blank();
            }
        }
        Ok(())
    }

    pub(crate) fn emit_composite_defs(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
    ) -> Result<(), SchemaError> {
        let splits = self.facts.get(owner).split_views;

        if splits {
            self.emit_composite_struct(b, owner, composite, View::Input)?;
            self.emit_composite_struct(b, owner, composite, View::Output)?;
            self.emit_output_to_input(b, owner, composite)?;
        } else {
            self.emit_composite_struct(b, owner, composite, View::Output)?;
        }
        Ok(())
    }

    fn emit_composite_struct(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
        view: View,
    ) -> Result<(), SchemaError> {
        let struct_name = self.view_type_name(owner, view);
        b.line("#[derive(Debug, Clone, PartialEq)]");
        b.open(format!("pub struct {struct_name}"));

        for field in &composite.sequence {
            if !field_in_view(field, view) {
                continue;
            }
            if let FieldType::Bits(bits) = &field.ty {
                if !bits.subfields.is_empty() {
                    for sub in &bits.subfields {
                        b.line(format!(
                            "pub {}: {},",
                            field_ident(&sub.name),
                            super::uint_for_bit_width(sub.width)
                        ));
                    }
                    continue;
                }
            }
            let mut rust_ty = self.rust_type_of(owner, &field.name, &field.ty, view)?;
            if field.conditional.is_some() && !matches!(field.ty, FieldType::Optional(_)) {
                rust_ty = format!("Option<{rust_ty}>");
            }
            b.line(format!("pub {}: {rust_ty},", field_ident(&field.name)));
        }

        if view == View::Output {
            for instance in &composite.instances {
                let rust_ty = self.rust_type_of(owner, &instance.name, &instance.ty, view)?;
                b.line(format!("pub {}: {rust_ty},", field_ident(&instance.name)));
            }
        }

        b.close();
        b.blank();
        Ok(())
    }

    fn emit_output_to_input(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
    ) -> Result<(), SchemaError> {
        let output_name = self.view_type_name(owner, View::Output);
        let input_name = self.view_type_name(owner, View::Input);

        b.open(format!("impl From<{output_name}> for {input_name}"));
        b.open(format!("fn from(output: {output_name}) -> Self"));
        b.open("Self");
        for field in &composite.sequence {
            if !field_in_view(field, View::Input) {
                continue;
            }
            if let FieldType::Bits(bits) = &field.ty {
                if !bits.subfields.is_empty() {
                    for sub in &bits.subfields {
                        let ident = field_ident(&sub.name);
                        b.line(format!("{ident}: output.{ident},"));
                    }
                    continue;
                }
            }
            let ident = field_ident(&field.name);
            let expr = self.conversion_expr(&field.ty, &format!("output.{ident}"))?;
            if field.conditional.is_some()
                && !matches!(field.ty, FieldType::Optional(_))
                && self.shape_converts(&field.ty)?
            {
                // The conditional wrapper adds one more Option layer.
                b.line(format!("{ident}: output.{ident}.map(Into::into),"));
            } else {
                b.line(format!("{ident}: {expr},"));
            }
        }
        b.close_with("}");
        b.close();
        b.close();
        b.blank();
        Ok(())
    }

    /// Expression converting an Output-view value to its Input-view shape.
    pub(crate) fn conversion_expr(
        &self,
        ty: &FieldType,
        expr: &str,
    ) -> Result<String, SchemaError> {
        Ok(match ty {
            FieldType::Array(array) => {
                if self.shape_converts(&array.items)? {
                    format!("{expr}.into_iter().map(Into::into).collect()")
                } else {
                    expr.to_string()
                }
            }
            FieldType::Optional(optional) => {
                if self.shape_converts(&optional.value)? {
                    format!("{expr}.map(Into::into)")
                } else {
                    expr.to_string()
                }
            }
            _ => {
                if self.shape_converts(ty)? {
                    format!("{expr}.into()")
                } else {
                    expr.to_string()
                }
            }
        })
    }

    /// Whether a shape's Rust type differs between the Output and Input
    /// views (and therefore needs an `Into` at the conversion site).
    pub(crate) fn shape_converts(&self, ty: &FieldType) -> Result<bool, SchemaError> {
        Ok(match ty {
            FieldType::TypeRef(_) => match self.resolve_shape(ty)? {
                ResolvedShape::Inline(inner) => self.shape_converts(inner)?,
                ResolvedShape::Named { schema_name, .. } => {
                    self.facts.get(schema_name).split_views
                }
            },
            FieldType::BackReference(back_ref) => {
                let (resolved, _) = self.schema.resolve_alias(&back_ref.target).ok_or_else(
                    || SchemaError::UndefinedType {
                        referenced: back_ref.target.clone(),
                        referrer: "<codegen>".into(),
                    },
                )?;
                self.facts.get(resolved).split_views
            }
            FieldType::Choice(choice) => self.choice_splits(&choice.variants),
            FieldType::Array(array) => self.shape_converts(&array.items)?,
            FieldType::Optional(optional) => self.shape_converts(&optional.value)?,
            _ => false,
        })
    }

    pub(crate) fn emit_union_def(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        union: &UnionType,
    ) -> Result<(), SchemaError> {
        let splits = self.facts.get(owner).split_views;
        let views: &[View] = if splits {
            &[View::Input, View::Output]
        } else {
            &[View::Output]
        };

        for view in views {
            let enum_name = self.view_type_name(owner, *view);
            b.line("#[derive(Debug, Clone, PartialEq)]");
            b.open(format!("pub enum {enum_name}"));
            for variant in &union.variants {
                let (resolved, _) = self
                    .schema
                    .resolve_alias(&variant.type_name)
                    .ok_or_else(|| SchemaError::UndefinedType {
                        referenced: variant.type_name.clone(),
                        referrer: owner.to_string(),
                    })?;
                b.line(format!(
                    "{}({}),",
                    type_name(&variant.type_name),
                    self.view_type_name(resolved, *view)
                ));
            }
            b.close();
            b.blank();
        }

        if splits {
            let output_name = self.view_type_name(owner, View::Output);
            let input_name = self.view_type_name(owner, View::Input);
            b.open(format!("impl From<{output_name}> for {input_name}"));
            b.open(format!("fn from(output: {output_name}) -> Self"));
            b.open("match output");
            for variant in &union.variants {
                let variant_ident = type_name(&variant.type_name);
                let (resolved, _) = self.schema.resolve_alias(&variant.type_name).unwrap();
                if self.facts.get(resolved).split_views {
                    b.line(format!(
                        "{output_name}::{variant_ident}(v) => Self::{variant_ident}(v.into()),"
                    ));
                } else {
                    b.line(format!(
                        "{output_name}::{variant_ident}(v) => Self::{variant_ident}(v),"
                    ));
                }
            }
            b.close();
            b.close();
            b.close();
            b.blank();
        }
        Ok(())
    }
}

/// Whether a sequence field appears in the given view. Padding never
/// surfaces; const and computed fields are derived, so the Input view omits
/// them.
pub(crate) fn field_in_view(field: &Field, view: View) -> bool {
    if matches!(field.ty, FieldType::Padding(_)) {
        return false;
    }
    match view {
        View::Output => true,
        View::Input => field.const_value.is_none() && field.computed.is_none(),
    }
}

fn collect_choices<'s>(
    field_name: &'s str,
    ty: &'s FieldType,
    seen: &mut Vec<&'s str>,
    found: &mut Vec<(&'s str, &'s ChoiceType)>,
) -> Result<(), SchemaError> {
    let mut result = Ok(());
    walk_field_type(ty, &mut |nested| {
        if let FieldType::Choice(choice) = nested {
            if seen.contains(&field_name) {
                result = Err(SchemaError::Unsupported(format!(
                    "multiple inline choices under one field ('{field_name}')"
                )));
            } else {
                seen.push(field_name);
                found.push((field_name, choice));
            }
        }
    });
    result
}
