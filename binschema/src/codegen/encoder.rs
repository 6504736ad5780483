//! Emission of per-type encode routines.
//!
//! The emitted encode body is straight-line imperative over the Input
//! fields in declaration order. Computed fields resolve inline, deferred
//! lengths run the content-first two-pass against a temporary stream,
//! tracked arrays get a position pre-pass, and back-references probe the
//! shared compression dictionary.

use super::builder::CodeBuilder;
use super::names::{field_ident, tracking_key, type_name};
use super::{
    array_leading_bytes, is_byte_item, is_copy_shape, varlength_expr, Generator, ResolvedShape,
    View,
};
use crate::schema::{
    width_mask, ArrayKind, ArrayType, BackReferenceType, ComputedSpec, CompositeType, ConstValue,
    Field, FieldType, OffsetOrigin, Predicate, PresenceMarker, SchemaError, StringEncoding,
    StringKind, UnionType,
};

impl Generator<'_> {
    pub(crate) fn emit_composite_encode(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
    ) -> Result<(), SchemaError> {
        let facts = self.facts.get(owner);
        let has_ctx = facts.needs_encode_context;
        let wants_dict = facts.contains_back_reference;
        let input_name = self.view_type_name(owner, View::Input);

        b.open(format!("impl {input_name}"));

        b.line("/// Encodes the value to its wire bytes.");
        b.open("pub fn encode(&self) -> CodecResult<Vec<u8>>");
        b.line(format!(
            "let mut stream = BitStreamEncoder::new({});",
            self.bit_order_expr()
        ));
        b.line("self.encode_into(&mut stream)?;");
        b.line("Ok(stream.finish())");
        b.close();
        b.blank();

        if has_ctx {
            b.open("pub fn encode_into(&self, stream: &mut BitStreamEncoder) -> CodecResult<()>");
            b.line("let mut ctx = EncodeContext::new();");
            if wants_dict {
                b.line("ctx.ensure_compression_dict();");
            }
            b.line("self.encode_with_context(stream, &mut ctx)");
            b.close();
            b.blank();

            b.open(
                "pub fn encode_with_context(&self, stream: &mut BitStreamEncoder, \
                 ctx: &mut EncodeContext) -> CodecResult<()>",
            );
            self.emit_encode_body(b, owner, composite, true)?;
            b.line("Ok(())");
            b.close();
        } else {
            b.open("pub fn encode_into(&self, stream: &mut BitStreamEncoder) -> CodecResult<()>");
            self.emit_encode_body(b, owner, composite, false)?;
            b.line("Ok(())");
            b.close();
        }

        b.close();
        b.blank();
        Ok(())
    }

    pub(crate) fn emit_union_encode(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        union: &UnionType,
    ) -> Result<(), SchemaError> {
        let facts = self.facts.get(owner);
        let has_ctx = facts.needs_encode_context;
        let wants_dict = facts.contains_back_reference;
        let input_name = self.view_type_name(owner, View::Input);

        b.open(format!("impl {input_name}"));

        b.line("/// Encodes the selected variant to its wire bytes.");
        b.open("pub fn encode(&self) -> CodecResult<Vec<u8>>");
        b.line(format!(
            "let mut stream = BitStreamEncoder::new({});",
            self.bit_order_expr()
        ));
        b.line("self.encode_into(&mut stream)?;");
        b.line("Ok(stream.finish())");
        b.close();
        b.blank();

        if has_ctx {
            b.open("pub fn encode_into(&self, stream: &mut BitStreamEncoder) -> CodecResult<()>");
            b.line("let mut ctx = EncodeContext::new();");
            if wants_dict {
                b.line("ctx.ensure_compression_dict();");
            }
            b.line("self.encode_with_context(stream, &mut ctx)");
            b.close();
            b.blank();
            b.open(
                "pub fn encode_with_context(&self, stream: &mut BitStreamEncoder, \
                 ctx: &mut EncodeContext) -> CodecResult<()>",
            );
        } else {
            b.open("pub fn encode_into(&self, stream: &mut BitStreamEncoder) -> CodecResult<()>");
        }

        b.open("match self");
        for variant in &union.variants {
            let variant_ident = type_name(&variant.type_name);
            let (resolved, _) = self
                .schema
                .resolve_alias(&variant.type_name)
                .ok_or_else(|| SchemaError::UndefinedType {
                    referenced: variant.type_name.clone(),
                    referrer: owner.to_string(),
                })?;
            // The union adds no frame of its own, so the context passes
            // through untouched.
            if self.facts.get(resolved).needs_encode_context {
                b.line(format!(
                    "Self::{variant_ident}(__v) => __v.encode_with_context(stream, ctx)?,"
                ));
            } else {
                b.line(format!(
                    "Self::{variant_ident}(__v) => __v.encode_into(stream)?,"
                ));
            }
        }
        b.close();
        b.line("Ok(())");
        b.close();
        b.close();
        b.blank();
        Ok(())
    }

    fn emit_encode_body(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
        has_ctx: bool,
    ) -> Result<(), SchemaError> {
        let has_snapshot = has_ctx && self.any_child_needs_encode_context(composite)?;
        if has_snapshot {
            self.emit_snapshot(b, owner, composite)?;
        }

        let pos_targets = plain_position_targets(composite);
        self.emit_sequence_range(
            b,
            owner,
            composite,
            0..composite.sequence.len(),
            "stream",
            has_ctx,
            has_snapshot,
            &pos_targets,
            0,
            None,
        )
    }

    /// Emits writes for `sequence[range]` into `stream_var`, recursing for
    /// content-first suspensions. `mark_after` asks for a byte-offset mark
    /// right after the named field (inner boundary of a deferred length).
    #[allow(clippy::too_many_arguments)]
    fn emit_sequence_range(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
        range: std::ops::Range<usize>,
        stream_var: &str,
        has_ctx: bool,
        has_snapshot: bool,
        pos_targets: &[String],
        depth: usize,
        mark_after: Option<(&str, String)>,
    ) -> Result<(), SchemaError> {
        let end = range.end;
        for index in range {
            let field = &composite.sequence[index];
            let ident = field_ident(&field.name);

            if pos_targets.contains(&field.name) {
                let base = if has_ctx { "ctx.base_offset() + " } else { "" };
                b.line(format!(
                    "let __pos_{ident} = {base}{stream_var}.byte_offset();"
                ));
            }

            if let Some(ComputedSpec::LengthOf {
                from_after_field: Some(after),
                ..
            }) = &field.computed
            {
                let after_index = composite
                    .sequence
                    .iter()
                    .position(|other| &other.name == after)
                    .expect("validated by the analyzer");
                if after_index < index {
                    return Err(SchemaError::Unsupported(format!(
                        "from_after_field '{after}' precedes the length field \
                         ('{}' in '{owner}')",
                        field.name
                    )));
                }

                let dvar = format!("__deferred_{depth}");
                let mvar = format!("__mark_{depth}");
                let needs_mark = after != &field.name;
                b.line(format!(
                    "let mut {dvar}_buf = BitStreamEncoder::new({});",
                    self.bit_order_expr()
                ));
                b.line(format!("let {dvar} = &mut {dvar}_buf;"));
                self.emit_sequence_range(
                    b,
                    owner,
                    composite,
                    index + 1..end,
                    &dvar,
                    has_ctx,
                    has_snapshot,
                    pos_targets,
                    depth + 1,
                    needs_mark.then(|| (after.as_str(), mvar.clone())),
                )?;
                b.line(format!("let {dvar}_bytes = {dvar}_buf.finish();"));
                let value_expr = if needs_mark {
                    format!("(({dvar}_bytes.len() - {mvar}) as u64)")
                } else {
                    format!("({dvar}_bytes.len() as u64)")
                };
                self.emit_write_computed_value(b, owner, field, &value_expr, stream_var)?;
                b.line(format!("{stream_var}.write_bytes(&{dvar}_bytes)?;"));
                // The suspended range is fully consumed.
                return Ok(());
            }

            if field.computed.is_some() {
                let expr = self.emit_computed_value(b, owner, composite, field, has_ctx)?;
                self.emit_write_computed_value(b, owner, field, &expr, stream_var)?;
            } else if let Some(const_value) = &field.const_value {
                self.emit_write_const(b, owner, field, const_value, stream_var)?;
            } else if let Some(predicate) = &field.conditional {
                let subject = self.predicate_subject_encode(composite, predicate);
                b.open(format!(
                    "if {subject} {} {}u64",
                    predicate.op.as_rust(),
                    predicate.value
                ));
                if matches!(field.ty, FieldType::Optional(_)) {
                    self.emit_write_field(
                        b,
                        owner,
                        field,
                        stream_var,
                        has_ctx,
                        has_snapshot,
                    )?;
                } else {
                    let pattern = if is_copy_shape(&field.ty) {
                        "&__present"
                    } else {
                        "__present"
                    };
                    b.open(format!("if let Some({pattern}) = &self.{ident}"));
                    self.emit_write_shape(
                        b,
                        owner,
                        &field.name,
                        &field.ty,
                        "__present",
                        stream_var,
                        has_ctx,
                        has_snapshot,
                    )?;
                    b.close();
                }
                b.close();
            } else {
                self.emit_write_field(b, owner, field, stream_var, has_ctx, has_snapshot)?;
            }

            if let Some((mark_field, mark_var)) = &mark_after {
                if *mark_field == field.name {
                    b.line(format!("let {mark_var} = {stream_var}.byte_offset();"));
                }
            }
        }
        Ok(())
    }

    /// Writes one plain (non-const, non-computed) field.
    pub(crate) fn emit_write_field(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field: &Field,
        stream_var: &str,
        has_ctx: bool,
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        let ident = field_ident(&field.name);

        if let FieldType::Bits(bits) = &field.ty {
            if !bits.subfields.is_empty() {
                for sub in &bits.subfields {
                    b.line(format!(
                        "{stream_var}.write_bits(u64::from(self.{}), {})?;",
                        field_ident(&sub.name),
                        sub.width
                    ));
                }
                return Ok(());
            }
        }

        // Parenthesized so the borrow covers the whole place expression in
        // every emitted method-call position.
        let expr = if is_copy_shape(&field.ty) {
            format!("self.{ident}")
        } else {
            format!("(&self.{ident})")
        };
        self.emit_write_shape(
            b,
            owner,
            &field.name,
            &field.ty,
            &expr,
            stream_var,
            has_ctx,
            has_snapshot,
        )
    }

    /// Writes a value of the given wire shape. `expr` is a value for `Copy`
    /// shapes and a reference otherwise.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn emit_write_shape(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        ty: &FieldType,
        expr: &str,
        stream_var: &str,
        has_ctx: bool,
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        let fid = field_ident(field_name);
        match ty {
            FieldType::Uint(int) => {
                b.line(format!(
                    "{stream_var}.write_u{}({expr}, {})?;",
                    int.width,
                    self.order_expr(int.endianness)
                ));
            }
            FieldType::Int(int) => {
                b.line(format!(
                    "{stream_var}.write_i{}({expr}, {})?;",
                    int.width,
                    self.order_expr(int.endianness)
                ));
            }
            FieldType::Float(float) => {
                b.line(format!(
                    "{stream_var}.write_f{}({expr}, {})?;",
                    float.width,
                    self.order_expr(float.endianness)
                ));
            }
            FieldType::Bits(bits) => {
                b.line(format!(
                    "{stream_var}.write_bits(u64::from({expr}), {})?;",
                    bits.width
                ));
            }
            FieldType::Varlength(varlength) => {
                b.line(format!(
                    "{stream_var}.write_varlength(u64::from({expr}), {})?;",
                    varlength_expr(varlength.encoding)
                ));
            }
            FieldType::String(string) => {
                if string.kind == StringKind::LengthPrefixed {
                    let prefix = string.prefix.as_ref().expect("validated");
                    b.line(format!(
                        "{stream_var}.write_u{w}({expr}.len() as u{w}, {})?;",
                        self.order_expr(prefix.endianness),
                        w = prefix.width
                    ));
                }
                if string.kind == StringKind::Fixed {
                    let length = string.length.expect("validated");
                    b.open(format!("if {expr}.len() != {length}"));
                    b.line(format!(
                        "return Err(CodecError::InvalidValue(format!(\"fixed string '{field_name}' \
                         must be {length} bytes, got {{}}\", {expr}.len())));"
                    ));
                    b.close();
                }
                match string.encoding {
                    StringEncoding::Utf8 => {
                        b.line(format!("{stream_var}.write_bytes({expr}.as_bytes())?;"));
                    }
                    StringEncoding::Ascii => {
                        b.open(format!("if !{expr}.is_ascii()"));
                        b.line(format!(
                            "return Err(CodecError::InvalidValue(\"non-ASCII string in \
                             '{owner}.{field_name}'\".into()));"
                        ));
                        b.close();
                        b.line(format!("{stream_var}.write_bytes({expr}.as_bytes())?;"));
                    }
                    StringEncoding::Latin1 => {
                        b.line(format!(
                            "let __latin1_{fid} = {expr}.chars().map(|__c| if (__c as u32) < 0x100 \
                             {{ Ok(__c as u8) }} else {{ Err(CodecError::InvalidValue(\"non-Latin-1 \
                             character in '{owner}.{field_name}'\".into())) }})\
                             .collect::<CodecResult<Vec<u8>>>()?;"
                        ));
                        b.line(format!("{stream_var}.write_bytes(&__latin1_{fid})?;"));
                    }
                }
                if string.kind == StringKind::NullTerminated {
                    b.line(format!("{stream_var}.write_u8(0, ByteOrder::Big)?;"));
                }
            }
            FieldType::Array(array) => {
                self.emit_write_array(
                    b,
                    owner,
                    field_name,
                    array,
                    expr,
                    stream_var,
                    has_ctx,
                    has_snapshot,
                )?;
            }
            FieldType::Optional(optional) => {
                let pattern = if is_copy_shape(&optional.value) {
                    "&__v"
                } else {
                    "__v"
                };
                let (present, absent): (String, String) = match optional.marker {
                    PresenceMarker::Byte => (
                        format!("{stream_var}.write_u8(1, ByteOrder::Big)?;"),
                        format!("{stream_var}.write_u8(0, ByteOrder::Big)?;"),
                    ),
                    PresenceMarker::Bit => (
                        format!("{stream_var}.write_bits(1, 1)?;"),
                        format!("{stream_var}.write_bits(0, 1)?;"),
                    ),
                };
                b.open(format!("match {expr}"));
                b.open(format!("Some({pattern}) =>"));
                b.line(present);
                self.emit_write_shape(
                    b,
                    owner,
                    field_name,
                    &optional.value,
                    "__v",
                    stream_var,
                    has_ctx,
                    has_snapshot,
                )?;
                b.close();
                b.line(format!("None => {{ {absent} }}"));
                b.close();
            }
            FieldType::Padding(padding) => {
                b.line(format!("{stream_var}.align_to_byte()?;"));
                b.open(format!(
                    "while {stream_var}.byte_offset() % {} != 0",
                    padding.align
                ));
                b.line(format!("{stream_var}.write_u8(0, ByteOrder::Big)?;"));
                b.close();
            }
            FieldType::TypeRef(_) => match self.resolve_shape(ty)? {
                ResolvedShape::Inline(inner) => {
                    self.emit_write_shape(
                        b,
                        owner,
                        field_name,
                        inner,
                        expr,
                        stream_var,
                        has_ctx,
                        has_snapshot,
                    )?;
                }
                ResolvedShape::Named { schema_name, .. } => {
                    self.emit_nested_encode(
                        b,
                        schema_name,
                        expr,
                        stream_var,
                        has_snapshot,
                    );
                }
            },
            FieldType::BackReference(back_ref) => {
                self.emit_write_back_reference(
                    b,
                    owner,
                    field_name,
                    back_ref,
                    expr,
                    stream_var,
                    has_snapshot,
                )?;
            }
            FieldType::Choice(choice) => {
                let enum_name =
                    self.choice_enum_name(owner, field_name, &choice.variants, View::Input);
                b.open(format!("match {expr}"));
                for variant in &choice.variants {
                    let variant_ident = type_name(variant);
                    let (resolved, _) = self.schema.resolve_alias(variant).ok_or_else(|| {
                        SchemaError::UndefinedType {
                            referenced: variant.clone(),
                            referrer: owner.to_string(),
                        }
                    })?;
                    b.open(format!("{enum_name}::{variant_ident}(__v) =>"));
                    self.emit_nested_encode(b, resolved, "__v", stream_var, has_snapshot);
                    b.close();
                }
                b.close();
            }
        }
        Ok(())
    }

    /// Call into a named type's encode, building a child context when the
    /// type needs one.
    fn emit_nested_encode(
        &self,
        b: &mut CodeBuilder,
        schema_name: &str,
        expr: &str,
        stream_var: &str,
        has_snapshot: bool,
    ) {
        if self.facts.get(schema_name).needs_encode_context {
            let snapshot = if has_snapshot {
                "__snapshot.clone()"
            } else {
                "FieldMap::default()"
            };
            b.line(format!(
                "let mut __child_ctx = ctx.extend_with_parent({snapshot});"
            ));
            b.line(format!(
                "{expr}.encode_with_context({stream_var}, &mut __child_ctx)?;"
            ));
        } else {
            b.line(format!("{expr}.encode_into({stream_var})?;"));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_write_array(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        array: &ArrayType,
        expr: &str,
        stream_var: &str,
        has_ctx: bool,
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        let fid = field_ident(field_name);
        let tracked = self.facts.get(owner).tracked_arrays.get(field_name);

        if let Some(tracked_types) = tracked {
            if has_ctx {
                self.emit_position_pre_pass(
                    b,
                    owner,
                    field_name,
                    array,
                    expr,
                    stream_var,
                    tracked_types,
                    has_snapshot,
                )?;
            }
        }

        // Leading frame.
        match array.kind {
            ArrayKind::LengthPrefixed => {
                let prefix = array.prefix.as_ref().expect("validated");
                b.line(format!(
                    "{stream_var}.write_u{w}({expr}.len() as u{w}, {})?;",
                    self.order_expr(prefix.endianness),
                    w = prefix.width
                ));
            }
            ArrayKind::ByteLengthPrefixed => {
                let prefix = array.prefix.as_ref().expect("validated");
                b.line(format!("let __byte_len_{fid} = {{"));
                b.indent();
                b.line(format!(
                    "let mut __tmp_buf = BitStreamEncoder::new({});",
                    self.bit_order_expr()
                ));
                b.line("let __tmp = &mut __tmp_buf;");
                if has_ctx {
                    b.line("let mut __m_ctx = ctx.for_measurement();");
                    b.line("let ctx = &mut __m_ctx;");
                }
                self.emit_array_items_loop(
                    b,
                    owner,
                    field_name,
                    array,
                    expr,
                    "__tmp",
                    has_ctx,
                    has_snapshot,
                )?;
                b.line("__tmp_buf.finish().len()");
                b.close_with("};");
                b.line(format!(
                    "{stream_var}.write_u{w}(__byte_len_{fid} as u{w}, {})?;",
                    self.order_expr(prefix.endianness),
                    w = prefix.width
                ));
            }
            ArrayKind::Fixed => {
                let count = array.count.expect("validated");
                b.open(format!("if {expr}.len() != {count}"));
                b.line(format!(
                    "return Err(CodecError::InvalidValue(format!(\"fixed array \
                     '{owner}.{field_name}' must have {count} elements, got {{}}\", \
                     {expr}.len())));"
                ));
                b.close();
            }
            _ => {}
        }

        if array.kind == ArrayKind::LengthPrefixedItems {
            // Each element carries its own byte-length prefix, so elements
            // are measured and spliced.
            let prefix = array.prefix.as_ref().expect("validated");
            self.emit_per_item_prefixed_loop(
                b,
                owner,
                field_name,
                array,
                expr,
                stream_var,
                prefix.width,
                self.order_expr(prefix.endianness),
                has_ctx,
                has_snapshot,
            )?;
        } else {
            self.emit_array_items_loop(
                b,
                owner,
                field_name,
                array,
                expr,
                stream_var,
                has_ctx,
                has_snapshot,
            )?;
        }

        if array.kind == ArrayKind::NullTerminated {
            b.line(format!("{stream_var}.write_u8(0, ByteOrder::Big)?;"));
        }
        Ok(())
    }

    /// The main item loop, with iteration state maintenance when a context
    /// is present.
    #[allow(clippy::too_many_arguments)]
    fn emit_array_items_loop(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        array: &ArrayType,
        expr: &str,
        stream_var: &str,
        has_ctx: bool,
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        if is_byte_item(&array.items) {
            b.line(format!("{stream_var}.write_bytes({expr})?;"));
            return Ok(());
        }

        let item_binding = if is_copy_shape(&array.items) {
            "&__item"
        } else {
            "__item"
        };
        if has_ctx {
            b.open(format!(
                "for (__index, {item_binding}) in {expr}.iter().enumerate()"
            ));
            b.line(format!(
                "ctx.set_array_iteration(\"{field_name}\", __index);"
            ));
        } else {
            b.open(format!("for {item_binding} in {expr}"));
        }

        match &array.items {
            FieldType::Choice(choice) => {
                let enum_name =
                    self.choice_enum_name(owner, field_name, &choice.variants, View::Input);
                b.open("match __item");
                for variant in &choice.variants {
                    let variant_ident = type_name(variant);
                    let (resolved, _) = self.schema.resolve_alias(variant).ok_or_else(|| {
                        SchemaError::UndefinedType {
                            referenced: variant.clone(),
                            referrer: owner.to_string(),
                        }
                    })?;
                    b.open(format!("{enum_name}::{variant_ident}(__v) =>"));
                    if has_ctx {
                        b.line(format!(
                            "ctx.bump_type_index(\"{}\");",
                            tracking_key(field_name, variant)
                        ));
                    }
                    self.emit_nested_encode(b, resolved, "__v", stream_var, has_snapshot);
                    b.close();
                }
                b.close();
            }
            FieldType::TypeRef(type_ref) => {
                if has_ctx {
                    b.line(format!(
                        "ctx.bump_type_index(\"{}\");",
                        tracking_key(field_name, &type_ref.target)
                    ));
                }
                self.emit_write_shape(
                    b,
                    owner,
                    field_name,
                    &array.items,
                    "__item",
                    stream_var,
                    has_ctx,
                    has_snapshot,
                )?;
            }
            items => {
                self.emit_write_shape(
                    b, owner, field_name, items, "__item", stream_var, has_ctx, has_snapshot,
                )?;
            }
        }
        b.close();
        Ok(())
    }

    /// Loop for `length_prefixed_items`: measure, prefix, splice.
    #[allow(clippy::too_many_arguments)]
    fn emit_per_item_prefixed_loop(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        array: &ArrayType,
        expr: &str,
        stream_var: &str,
        prefix_width: u32,
        prefix_order: &str,
        has_ctx: bool,
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        let item_binding = if is_copy_shape(&array.items) {
            "&__item"
        } else {
            "__item"
        };
        b.open(format!("for {item_binding} in {expr}"));
        b.line("let __item_bytes = {");
        b.indent();
        b.line(format!(
            "let mut __tmp_buf = BitStreamEncoder::new({});",
            self.bit_order_expr()
        ));
        b.line("let __tmp = &mut __tmp_buf;");
        if has_ctx {
            b.line("let mut __m_ctx = ctx.for_measurement();");
            b.line("let ctx = &mut __m_ctx;");
        }
        self.emit_write_shape(
            b,
            owner,
            field_name,
            &array.items,
            "__item",
            "__tmp",
            has_ctx,
            has_snapshot,
        )?;
        b.line("__tmp_buf.finish()");
        b.close_with("};");
        b.line(format!(
            "{stream_var}.write_u{w}(__item_bytes.len() as u{w}, {prefix_order})?;",
            w = prefix_width
        ));
        b.line(format!("{stream_var}.write_bytes(&__item_bytes)?;"));
        b.close();
        Ok(())
    }

    /// Projects item offsets without emitting, recording positions for the
    /// tracked variant types.
    #[allow(clippy::too_many_arguments)]
    fn emit_position_pre_pass(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        array: &ArrayType,
        expr: &str,
        stream_var: &str,
        tracked_types: &[String],
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        let lead = array_leading_bytes(array.kind, array.prefix.as_ref());
        let item_lead = if array.kind == ArrayKind::LengthPrefixedItems {
            array.prefix.as_ref().map_or(0, |p| p.width as usize / 8)
        } else {
            0
        };

        b.line(format!(
            "let mut __projected = ctx.base_offset() + {stream_var}.byte_offset() + {lead};"
        ));
        b.open(format!("for __item in {expr}"));

        match &array.items {
            FieldType::Choice(choice) => {
                let enum_name =
                    self.choice_enum_name(owner, field_name, &choice.variants, View::Input);
                b.open("let __size = match __item");
                for variant in &choice.variants {
                    let variant_ident = type_name(variant);
                    let (resolved, _) = self.schema.resolve_alias(variant).ok_or_else(|| {
                        SchemaError::UndefinedType {
                            referenced: variant.clone(),
                            referrer: owner.to_string(),
                        }
                    })?;
                    b.open(format!("{enum_name}::{variant_ident}(__v) =>"));
                    if tracked_types.contains(variant) {
                        b.line(format!(
                            "ctx.track_position(\"{}\", __projected + {item_lead});",
                            tracking_key(field_name, variant)
                        ));
                    }
                    self.emit_measure_named(b, resolved, "__v", "__v_bytes", has_snapshot)?;
                    b.line("__v_bytes.len()");
                    b.close();
                }
                b.close_with("};");
            }
            FieldType::TypeRef(type_ref) => {
                if tracked_types.contains(&type_ref.target) {
                    b.line(format!(
                        "ctx.track_position(\"{}\", __projected + {item_lead});",
                        tracking_key(field_name, &type_ref.target)
                    ));
                }
                let (resolved, _) = self
                    .schema
                    .resolve_alias(&type_ref.target)
                    .ok_or_else(|| SchemaError::UndefinedType {
                        referenced: type_ref.target.clone(),
                        referrer: owner.to_string(),
                    })?;
                self.emit_measure_named(b, resolved, "__item", "__v_bytes", has_snapshot)?;
                b.line("let __size = __v_bytes.len();");
            }
            _ => {
                return Err(SchemaError::Unsupported(format!(
                    "position tracking over an array of unnamed items \
                     ('{field_name}' in '{owner}')"
                )))
            }
        }

        b.line(format!("__projected += __size + {item_lead};"));
        b.close();
        Ok(())
    }

    /// Encode-to-bytes probe of the compression dictionary, then pointer or
    /// inline emission.
    #[allow(clippy::too_many_arguments)]
    fn emit_write_back_reference(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        back_ref: &BackReferenceType,
        expr: &str,
        stream_var: &str,
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        let fid = field_ident(field_name);
        let (resolved, _) = self
            .schema
            .resolve_alias(&back_ref.target)
            .ok_or_else(|| SchemaError::UndefinedType {
                referenced: back_ref.target.clone(),
                referrer: owner.to_string(),
            })?;
        let width = back_ref.storage.width;
        let marker = width_mask(width) & !back_ref.mask;
        let mask = back_ref.mask;
        let order = self.order_expr(back_ref.storage.endianness);

        self.emit_measure_named(b, resolved, expr, &format!("__bref_bytes_{fid}"), has_snapshot)?;
        b.line(format!(
            "let __dict_{fid} = ctx.compression_dict().cloned().ok_or_else(|| \
             CodecError::InvalidValue(\"compression dictionary missing\".into()))?;"
        ));
        b.line(format!(
            "let __hit_{fid} = __dict_{fid}.borrow().get(&__bref_bytes_{fid}).copied();"
        ));
        b.open(format!("match __hit_{fid}"));

        b.open("Some(__target) =>");
        match back_ref.origin {
            OffsetOrigin::MessageStart => {
                b.line(format!("let __pointer_bits = __target as u64;"));
            }
            OffsetOrigin::CurrentPosition => {
                b.line(format!(
                    "let __here = ctx.base_offset() + {stream_var}.byte_offset();"
                ));
                b.line("let __pointer_bits = (__here - __target) as u64;");
            }
        }
        b.open(format!("if __pointer_bits > {mask:#x}u64"));
        b.line(format!(
            "return Err(CodecError::InvalidValue(format!(\"back-reference offset {{}} exceeds \
             the pointer mask\", __pointer_bits)));"
        ));
        b.close();
        b.line(format!(
            "{stream_var}.write_u{width}(({marker:#x}u64 | __pointer_bits) as u{width}, {order})?;"
        ));
        b.close();

        b.open("None =>");
        b.line(format!(
            "let __offset = ctx.base_offset() + {stream_var}.byte_offset();"
        ));
        b.line(format!(
            "__dict_{fid}.borrow_mut().insert(__bref_bytes_{fid}.clone(), __offset);"
        ));
        b.line(format!("{stream_var}.write_bytes(&__bref_bytes_{fid})?;"));
        b.close();

        b.close();
        Ok(())
    }

    /// Binds `{out_var}` to the encoded bytes of a named-type value.
    pub(crate) fn emit_measure_named(
        &self,
        b: &mut CodeBuilder,
        schema_name: &str,
        value_expr: &str,
        out_var: &str,
        has_snapshot: bool,
    ) -> Result<(), SchemaError> {
        b.line(format!("let {out_var} = {{"));
        b.indent();
        b.line(format!(
            "let mut __tmp = BitStreamEncoder::new({});",
            self.bit_order_expr()
        ));
        if self.facts.get(schema_name).needs_encode_context {
            let base = if has_snapshot {
                "ctx.extend_with_parent(__snapshot.clone()).for_measurement()"
            } else {
                "ctx.for_measurement()"
            };
            b.line(format!("let mut __tmp_ctx = {base};"));
            b.line(format!(
                "{value_expr}.encode_with_context(&mut __tmp, &mut __tmp_ctx)?;"
            ));
        } else {
            b.line(format!("{value_expr}.encode_into(&mut __tmp)?;"));
        }
        b.line("__tmp.finish()");
        b.close_with("};");
        Ok(())
    }

    /// Binds `{out_var}` to the encoded bytes of a whole field (with its
    /// framing), for `length_of` / `crc32_of` targets that need measuring.
    pub(crate) fn emit_measure_field(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        _composite: &CompositeType,
        field: &Field,
        out_var: &str,
        has_ctx: bool,
    ) -> Result<(), SchemaError> {
        b.line(format!("let {out_var} = {{"));
        b.indent();
        b.line(format!(
            "let mut __tmp_buf = BitStreamEncoder::new({});",
            self.bit_order_expr()
        ));
        b.line("let __tmp = &mut __tmp_buf;");
        if has_ctx {
            b.line("let mut __m_ctx = ctx.for_measurement();");
            b.line("let ctx = &mut __m_ctx;");
        }
        self.emit_write_field(b, owner, field, "__tmp", has_ctx, false)?;
        b.line("__tmp_buf.finish()");
        b.close_with("};");
        Ok(())
    }

    /// Writes a computed value at the field's declared wire shape.
    fn emit_write_computed_value(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field: &Field,
        value_expr: &str,
        stream_var: &str,
    ) -> Result<(), SchemaError> {
        match &field.ty {
            FieldType::Uint(int) => {
                b.line(format!(
                    "{stream_var}.write_u{w}(({value_expr}) as u{w}, {})?;",
                    self.order_expr(int.endianness),
                    w = int.width
                ));
            }
            FieldType::Int(int) => {
                b.line(format!(
                    "{stream_var}.write_i{w}(({value_expr}) as i{w}, {})?;",
                    self.order_expr(int.endianness),
                    w = int.width
                ));
            }
            FieldType::Bits(bits) => {
                b.line(format!(
                    "{stream_var}.write_bits({value_expr}, {})?;",
                    bits.width
                ));
            }
            FieldType::Varlength(varlength) => {
                b.line(format!(
                    "{stream_var}.write_varlength({value_expr}, {})?;",
                    varlength_expr(varlength.encoding)
                ));
            }
            other => {
                return Err(SchemaError::Unsupported(format!(
                    "computed field '{}' in '{owner}' has non-integer shape {other:?}",
                    field.name
                )))
            }
        }
        Ok(())
    }

    /// Writes a schema-declared literal.
    pub(crate) fn emit_write_const(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field: &Field,
        const_value: &ConstValue,
        stream_var: &str,
    ) -> Result<(), SchemaError> {
        match (&field.ty, const_value) {
            (FieldType::Uint(int), ConstValue::Uint(value)) => {
                b.line(format!(
                    "{stream_var}.write_u{w}({value:#x}u{w}, {})?;",
                    self.order_expr(int.endianness),
                    w = int.width
                ));
            }
            (FieldType::Int(int), ConstValue::Int(value)) => {
                b.line(format!(
                    "{stream_var}.write_i{w}({value}i{w}, {})?;",
                    self.order_expr(int.endianness),
                    w = int.width
                ));
            }
            (FieldType::Int(int), ConstValue::Uint(value)) => {
                b.line(format!(
                    "{stream_var}.write_i{w}({value}i{w}, {})?;",
                    self.order_expr(int.endianness),
                    w = int.width
                ));
            }
            (FieldType::Bits(bits), ConstValue::Uint(value)) => {
                b.line(format!(
                    "{stream_var}.write_bits({value:#x}, {})?;",
                    bits.width
                ));
            }
            (FieldType::Varlength(varlength), ConstValue::Uint(value)) => {
                b.line(format!(
                    "{stream_var}.write_varlength({value}, {})?;",
                    varlength_expr(varlength.encoding)
                ));
            }
            (FieldType::String(_), ConstValue::Str(value)) => {
                self.emit_write_shape(
                    b,
                    owner,
                    &field.name,
                    &field.ty,
                    &format!("\"{value}\""),
                    stream_var,
                    false,
                    false,
                )?;
            }
            (FieldType::Array(array), ConstValue::Bytes(bytes)) if is_byte_item(&array.items) => {
                let literal = bytes
                    .iter()
                    .map(|byte| format!("{byte:#x}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                if array.kind == ArrayKind::LengthPrefixed
                    || array.kind == ArrayKind::ByteLengthPrefixed
                {
                    let prefix = array.prefix.as_ref().expect("validated");
                    b.line(format!(
                        "{stream_var}.write_u{w}({len} as u{w}, {})?;",
                        self.order_expr(prefix.endianness),
                        w = prefix.width,
                        len = bytes.len()
                    ));
                }
                b.line(format!("{stream_var}.write_bytes(&[{literal}u8])?;"));
            }
            (ty, value) => {
                return Err(SchemaError::Unsupported(format!(
                    "const {value:?} on field '{}' of shape {ty:?} in '{owner}'",
                    field.name
                )))
            }
        }
        Ok(())
    }

    /// Builds the snapshot map children resolve `../` targets against.
    fn emit_snapshot(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
    ) -> Result<(), SchemaError> {
        b.line("let mut __snapshot = FieldMap::default();");
        for field in &composite.sequence {
            // Derived fields are not caller-supplied; they never land in
            // the snapshot.
            if field.const_value.is_some() || field.computed.is_some() {
                continue;
            }
            let ident = field_ident(&field.name);
            if field.conditional.is_some() && !matches!(field.ty, FieldType::Optional(_)) {
                if let Some(insert) =
                    self.snapshot_value(owner, field, "__cond", true)?
                {
                    b.open(format!("if let Some(__cond) = &self.{ident}"));
                    b.line(format!(
                        "__snapshot.insert(\"{}\".into(), {insert});",
                        field.name
                    ));
                    b.close();
                }
                continue;
            }
            match &field.ty {
                FieldType::Bits(bits) if !bits.subfields.is_empty() => {
                    for sub in &bits.subfields {
                        b.line(format!(
                            "__snapshot.insert(\"{}\".into(), \
                             FieldValue::Uint(u64::from(self.{})));",
                            sub.name,
                            field_ident(&sub.name)
                        ));
                    }
                }
                FieldType::Array(array)
                    if !is_byte_item(&array.items)
                        && matches!(
                            array.items,
                            FieldType::Choice(_) | FieldType::TypeRef(_)
                        ) =>
                {
                    self.emit_snapshot_items(b, owner, field, array)?;
                }
                _ => {
                    if let Some(insert) = self.snapshot_value(
                        owner,
                        field,
                        &format!("self.{ident}"),
                        false,
                    )? {
                        b.line(format!(
                            "__snapshot.insert(\"{}\".into(), {insert});",
                            field.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// The `FieldValue` constructor for one snapshot entry, or `None` for
    /// shapes the snapshot does not carry.
    fn snapshot_value(
        &self,
        _owner: &str,
        field: &Field,
        expr: &str,
        via_ref: bool,
    ) -> Result<Option<String>, SchemaError> {
        let deref = if via_ref { "*" } else { "" };
        Ok(match &field.ty {
            FieldType::Uint(_) | FieldType::Bits(_) | FieldType::Varlength(_) => Some(format!(
                "FieldValue::Uint(({deref}{expr}) as u64)"
            )),
            FieldType::Int(_) => Some(format!("FieldValue::Int(({deref}{expr}) as i64)")),
            FieldType::Float(_) => Some(format!("FieldValue::Float(({deref}{expr}) as f64)")),
            FieldType::String(_) => Some(format!("FieldValue::Str({expr}.clone())")),
            FieldType::Array(array) if is_byte_item(&array.items) => {
                Some(format!("FieldValue::Bytes({expr}.clone())"))
            }
            _ => None,
        })
    }

    /// Materializes a typed array as `FieldValue::Items` with per-element
    /// encoded sizes and primitive field maps.
    fn emit_snapshot_items(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field: &Field,
        array: &ArrayType,
    ) -> Result<(), SchemaError> {
        let ident = field_ident(&field.name);
        b.line(format!(
            "__snapshot.insert(\"{}\".into(), FieldValue::Items({{",
            field.name
        ));
        b.indent();
        b.line("let mut __items = Vec::new();");
        b.open(format!("for __item in &self.{ident}"));

        match &array.items {
            FieldType::Choice(choice) => {
                let enum_name =
                    self.choice_enum_name(owner, &field.name, &choice.variants, View::Input);
                b.open("match __item");
                for variant in &choice.variants {
                    let variant_ident = type_name(variant);
                    let (resolved, def) = self.schema.resolve_alias(variant).ok_or_else(|| {
                        SchemaError::UndefinedType {
                            referenced: variant.clone(),
                            referrer: owner.to_string(),
                        }
                    })?;
                    b.open(format!("{enum_name}::{variant_ident}(__v) =>"));
                    self.emit_item_entry(b, variant, resolved, def)?;
                    b.close();
                }
                b.close();
            }
            FieldType::TypeRef(type_ref) => {
                let (resolved, def) = self
                    .schema
                    .resolve_alias(&type_ref.target)
                    .ok_or_else(|| SchemaError::UndefinedType {
                        referenced: type_ref.target.clone(),
                        referrer: owner.to_string(),
                    })?;
                b.line("let __v = __item;");
                self.emit_item_entry(b, &type_ref.target, resolved, def)?;
            }
            _ => unreachable!("guarded by the caller"),
        }

        b.close();
        b.line("__items");
        b.close_with("}));");
        Ok(())
    }

    /// One `ItemEntry` push: measure the element, collect its primitive
    /// input fields.
    fn emit_item_entry(
        &self,
        b: &mut CodeBuilder,
        variant_schema_name: &str,
        resolved: &str,
        def: &crate::schema::TypeDef,
    ) -> Result<(), SchemaError> {
        self.emit_measure_named(b, resolved, "__v", "__v_bytes", false)?;
        b.line("let mut __fields = FieldMap::default();");
        if let crate::schema::TypeDef::Composite(composite) = def {
            for field in &composite.sequence {
                if field.const_value.is_some()
                    || field.computed.is_some()
                    || field.conditional.is_some()
                {
                    continue;
                }
                let ident = field_ident(&field.name);
                if let Some(insert) =
                    self.snapshot_value(resolved, field, &format!("__v.{ident}"), false)?
                {
                    b.line(format!(
                        "__fields.insert(\"{}\".into(), {insert});",
                        field.name
                    ));
                }
            }
        }
        b.line(format!(
            "__items.push(ItemEntry {{ type_name: \"{variant_schema_name}\".into(), \
             encoded_size: __v_bytes.len(), fields: __fields }});"
        ));
        Ok(())
    }

    /// Whether any directly-nested named type needs an encode context (the
    /// trigger for building a snapshot).
    fn any_child_needs_encode_context(
        &self,
        composite: &CompositeType,
    ) -> Result<bool, SchemaError> {
        for field in &composite.sequence {
            let mut found = false;
            crate::schema::walk_field_type(&field.ty, &mut |ty| match ty {
                FieldType::TypeRef(type_ref) => {
                    if let Some((resolved, _)) = self.schema.resolve_alias(&type_ref.target) {
                        found |= self.facts.get(resolved).needs_encode_context;
                    }
                }
                FieldType::Choice(choice) => {
                    for variant in &choice.variants {
                        if let Some((resolved, _)) = self.schema.resolve_alias(variant) {
                            found |= self.facts.get(resolved).needs_encode_context;
                        }
                    }
                }
                FieldType::BackReference(back_ref) => {
                    if let Some((resolved, _)) = self.schema.resolve_alias(&back_ref.target) {
                        found |= self.facts.get(resolved).needs_encode_context;
                    }
                }
                _ => {}
            });
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Subject expression for a conditional predicate at encode.
    fn predicate_subject_encode(
        &self,
        _composite: &CompositeType,
        predicate: &Predicate,
    ) -> String {
        if let Some(stripped) = predicate.field.strip_prefix("../") {
            let plain = stripped.trim_start_matches("../");
            format!(
                "ctx.find_parent_field(\"{plain}\").and_then(FieldValue::as_uint)\
                 .ok_or_else(|| CodecError::MissingContext(\"{plain}\".into()))?"
            )
        } else {
            format!("((self.{}) as u64)", field_ident(&predicate.field))
        }
    }
}

/// Names of plain same-frame `position_of` targets; the encoder captures
/// their offsets as it writes them.
pub(crate) fn plain_position_targets(composite: &CompositeType) -> Vec<String> {
    let mut targets = Vec::new();
    for field in &composite.sequence {
        if let Some(ComputedSpec::PositionOf { target }) = &field.computed {
            if let Ok(path) = crate::schema::TargetPath::parse(target) {
                if path.ascend == 0 && path.selector.is_none() && !targets.contains(&path.field) {
                    targets.push(path.field.clone());
                }
            }
        }
    }
    targets
}
