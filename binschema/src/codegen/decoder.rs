//! Emission of per-type decode routines.
//!
//! Fields read in declaration order; const fields validate with a
//! recoverable rejection so enclosing unions can retreat; instance fields
//! seek, decode, and restore; back-references probe the pointer marker and
//! either chase the offset or decode inline.

use super::builder::CodeBuilder;
use super::names::{field_ident, type_name};
use super::{is_byte_item, varlength_expr, Generator, ResolvedShape, View};
use crate::schema::{
    width_mask, ArrayKind, ArrayType, BackReferenceType, CompositeType, ConstValue, Discriminator,
    Field, FieldType, InstanceOffset, OffsetOrigin, Predicate, PresenceMarker, SchemaError,
    StringEncoding, StringKind, StringType, UnionType,
};

impl Generator<'_> {
    pub(crate) fn emit_composite_decode(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
    ) -> Result<(), SchemaError> {
        let facts = self.facts.get(owner);
        let has_ctx = facts.needs_decode_context;
        let output_name = self.view_type_name(owner, View::Output);

        b.open(format!("impl {output_name}"));

        b.line("/// Decodes a value from its wire bytes.");
        b.open("pub fn decode(bytes: &[u8]) -> CodecResult<Self>");
        b.line(format!(
            "let mut stream = BitStreamDecoder::new(bytes, {});",
            self.bit_order_expr()
        ));
        b.line("Self::decode_with_stream(&mut stream)");
        b.close();
        b.blank();

        if has_ctx {
            b.open(
                "pub fn decode_with_stream(stream: &mut BitStreamDecoder<'_>) -> CodecResult<Self>",
            );
            b.line("let ctx = DecodeContext::new();");
            b.line("Self::decode_with_stream_and_context(stream, &ctx)");
            b.close();
            b.blank();
            b.open(
                "pub fn decode_with_stream_and_context(stream: &mut BitStreamDecoder<'_>, \
                 ctx: &DecodeContext) -> CodecResult<Self>",
            );
        } else {
            b.open(
                "pub fn decode_with_stream(stream: &mut BitStreamDecoder<'_>) -> CodecResult<Self>",
            );
        }

        self.emit_decode_body(b, owner, composite, has_ctx)?;
        b.close();
        b.close();
        b.blank();
        Ok(())
    }

    fn emit_decode_body(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
        has_ctx: bool,
    ) -> Result<(), SchemaError> {
        let mut locals: Vec<String> = Vec::new();
        let mut struct_fields: Vec<String> = Vec::new();

        for field in &composite.sequence {
            let ident = field_ident(&field.name);

            if let FieldType::Padding(padding) = &field.ty {
                b.line("stream.align_to_byte()?;");
                b.open(format!(
                    "while stream.position()? % {} != 0",
                    padding.align
                ));
                b.line("let _ = stream.read_u8(ByteOrder::Big)?;");
                b.close();
                continue;
            }

            if let FieldType::Bits(bits) = &field.ty {
                if !bits.subfields.is_empty() {
                    for sub in &bits.subfields {
                        let sub_ident = field_ident(&sub.name);
                        b.line(format!(
                            "let {sub_ident} = stream.read_bits({})? as {};",
                            sub.width,
                            super::uint_for_bit_width(sub.width)
                        ));
                        locals.push(sub.name.clone());
                        struct_fields.push(sub_ident);
                    }
                    continue;
                }
            }

            if let Some(predicate) = &field.conditional {
                let subject = self.predicate_subject_decode(predicate, &locals);
                let inner_is_optional = matches!(field.ty, FieldType::Optional(_));
                b.line(format!("let {ident} = {{"));
                b.indent();
                b.open(format!(
                    "if {subject} {} {}u64",
                    predicate.op.as_rust(),
                    predicate.value
                ));
                self.emit_read_field_value(
                    b, owner, field, "__cond", "stream", has_ctx, &locals,
                )?;
                if inner_is_optional {
                    b.line("__cond");
                } else {
                    b.line("Some(__cond)");
                }
                b.close_with("} else {");
                b.indent();
                b.line("None");
                b.close_with("}");
                b.close_with("};");
            } else {
                self.emit_read_field_value(b, owner, field, &ident, "stream", has_ctx, &locals)?;
                if let Some(const_value) = &field.const_value {
                    self.emit_const_validation(b, owner, field, const_value)?;
                }
            }

            locals.push(field.name.clone());
            struct_fields.push(ident);
        }

        for instance in &composite.instances {
            let ident = field_ident(&instance.name);
            let saved = format!("__saved_{ident}");
            b.line(format!("let {saved} = stream.position()?;"));
            let offset_expr = match &instance.offset {
                InstanceOffset::Fixed(ofs) if *ofs >= 0 => format!("{ofs}usize"),
                InstanceOffset::Fixed(ofs) => {
                    format!("stream.bytes_len() - {}usize", ofs.unsigned_abs())
                }
                InstanceOffset::FieldRef(name) => {
                    if locals.iter().any(|local| local == name) {
                        format!("({}) as usize", field_ident(name))
                    } else {
                        return Err(SchemaError::InvalidField {
                            type_name: owner.to_string(),
                            field: instance.name.clone(),
                            reason: format!("instance offset field '{name}' is not decoded"),
                        });
                    }
                }
            };
            b.line(format!("stream.seek({offset_expr})?;"));
            self.emit_read_shape(b, owner, &instance.name, &instance.ty, &ident, "stream", has_ctx, &locals)?;
            b.line(format!("stream.seek({saved})?;"));
            struct_fields.push(ident);
        }

        b.open("Ok(Self");
        for ident in &struct_fields {
            b.line(format!("{ident},"));
        }
        b.close_with("})");
        Ok(())
    }

    /// Reads one sequence field into `dest`, honoring a `byte_budget`
    /// sub-stream when declared.
    #[allow(clippy::too_many_arguments)]
    fn emit_read_field_value(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field: &Field,
        dest: &str,
        stream_var: &str,
        has_ctx: bool,
        locals: &[String],
    ) -> Result<(), SchemaError> {
        if let Some(budget_field) = &field.byte_budget {
            let fid = field_ident(&field.name);
            let src = self.decode_length_source(budget_field, locals, has_ctx);
            b.line(format!("let __budget_{fid} = ({src}) as usize;"));
            b.line(format!(
                "let __body_{fid} = {stream_var}.read_byte_vec(__budget_{fid})?;"
            ));
            b.line(format!(
                "let mut __sub_buf_{fid} = BitStreamDecoder::new(&__body_{fid}, {});",
                self.bit_order_expr()
            ));
            b.line(format!("let __sub_{fid} = &mut __sub_buf_{fid};"));
            let sub = format!("__sub_{fid}");
            return self.emit_read_shape(b, owner, &field.name, &field.ty, dest, &sub, has_ctx, locals);
        }
        self.emit_read_shape(b, owner, &field.name, &field.ty, dest, stream_var, has_ctx, locals)
    }

    /// Emits `let {dest} = <decoded value>;` for a wire shape.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn emit_read_shape(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        ty: &FieldType,
        dest: &str,
        stream_var: &str,
        has_ctx: bool,
        locals: &[String],
    ) -> Result<(), SchemaError> {
        match ty {
            FieldType::Uint(int) => {
                b.line(format!(
                    "let {dest} = {stream_var}.read_u{}({})?;",
                    int.width,
                    self.order_expr(int.endianness)
                ));
            }
            FieldType::Int(int) => {
                b.line(format!(
                    "let {dest} = {stream_var}.read_i{}({})?;",
                    int.width,
                    self.order_expr(int.endianness)
                ));
            }
            FieldType::Float(float) => {
                b.line(format!(
                    "let {dest} = {stream_var}.read_f{}({})?;",
                    float.width,
                    self.order_expr(float.endianness)
                ));
            }
            FieldType::Bits(bits) => {
                b.line(format!(
                    "let {dest} = {stream_var}.read_bits({})? as {};",
                    bits.width,
                    super::uint_for_bit_width(bits.width)
                ));
            }
            FieldType::Varlength(varlength) => {
                b.line(format!(
                    "let {dest} = {stream_var}.read_varlength({})?;",
                    varlength_expr(varlength.encoding)
                ));
            }
            FieldType::String(string) => {
                self.emit_read_string(b, owner, field_name, string, dest, stream_var, has_ctx, locals)?;
            }
            FieldType::Array(array) => {
                self.emit_read_array(b, owner, field_name, array, dest, stream_var, has_ctx, locals)?;
            }
            FieldType::Optional(optional) => {
                b.line(format!("let {dest} = {{"));
                b.indent();
                match optional.marker {
                    PresenceMarker::Byte => {
                        b.line(format!(
                            "let __present = {stream_var}.read_u8(ByteOrder::Big)?;"
                        ));
                    }
                    PresenceMarker::Bit => {
                        b.line(format!("let __present = {stream_var}.read_bits(1)?;"));
                    }
                }
                b.open("if __present != 0");
                self.emit_read_shape(
                    b, owner, field_name, &optional.value, "__opt", stream_var, has_ctx, locals,
                )?;
                b.line("Some(__opt)");
                b.close_with("} else {");
                b.indent();
                b.line("None");
                b.close_with("}");
                b.close_with("};");
            }
            FieldType::Padding(_) => {
                return Err(SchemaError::Unsupported(format!(
                    "padding cannot be read as a value ('{field_name}' in '{owner}')"
                )))
            }
            FieldType::TypeRef(_) => match self.resolve_shape(ty)? {
                ResolvedShape::Inline(inner) => {
                    self.emit_read_shape(
                        b, owner, field_name, inner, dest, stream_var, has_ctx, locals,
                    )?;
                }
                ResolvedShape::Named { schema_name, .. } => {
                    let call =
                        self.prep_nested_decode(b, schema_name, stream_var, locals, has_ctx);
                    b.line(format!("let {dest} = {call}?;"));
                }
            },
            FieldType::BackReference(back_ref) => {
                self.emit_read_back_reference(
                    b, owner, field_name, back_ref, dest, stream_var, has_ctx, locals,
                )?;
            }
            FieldType::Choice(choice) => {
                let enum_name =
                    self.choice_enum_name(owner, field_name, &choice.variants, View::Output);
                let label = format!("'__choice_{}", field_ident(field_name));
                b.line(format!("let {dest} = {label}: {{"));
                b.indent();
                b.line(format!("let __start = {stream_var}.position()?;"));
                for variant in &choice.variants {
                    let variant_ident = type_name(variant);
                    let (resolved, _) = self.schema.resolve_alias(variant).ok_or_else(|| {
                        SchemaError::UndefinedType {
                            referenced: variant.clone(),
                            referrer: owner.to_string(),
                        }
                    })?;
                    let call =
                        self.prep_nested_decode(b, resolved, stream_var, locals, has_ctx);
                    b.open(format!("match {call}"));
                    b.line(format!(
                        "Ok(__v) => break {label} {enum_name}::{variant_ident}(__v),"
                    ));
                    b.open("Err(__e) if __e.is_variant_recoverable() =>");
                    b.line(format!("{stream_var}.seek(__start)?;"));
                    b.close();
                    b.line("Err(__e) => return Err(__e),");
                    b.close();
                }
                b.line(format!(
                    "return Err(CodecError::NoVariantMatched(\"{owner}.{field_name}\".into()));"
                ));
                b.close_with("};");
            }
        }
        Ok(())
    }

    /// String decode: kind-specific framing, then encoding conversion.
    #[allow(clippy::too_many_arguments)]
    fn emit_read_string(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        string: &StringType,
        dest: &str,
        stream_var: &str,
        has_ctx: bool,
        locals: &[String],
    ) -> Result<(), SchemaError> {
        b.line(format!("let {dest} = {{"));
        b.indent();
        match string.kind {
            StringKind::LengthPrefixed => {
                let prefix = string.prefix.as_ref().expect("validated");
                b.line(format!(
                    "let __len = {stream_var}.read_u{}({})? as usize;",
                    prefix.width,
                    self.order_expr(prefix.endianness)
                ));
                b.line(format!(
                    "let __bytes = {stream_var}.read_byte_vec(__len)?;"
                ));
            }
            StringKind::NullTerminated => {
                b.line("let mut __bytes = Vec::new();");
                b.open("loop");
                b.line(format!(
                    "let __b = {stream_var}.read_u8(ByteOrder::Big)?;"
                ));
                b.line("if __b == 0 { break; }");
                b.line("__bytes.push(__b);");
                b.close();
            }
            StringKind::Fixed => {
                let length = string.length.expect("validated");
                b.line(format!(
                    "let __bytes = {stream_var}.read_byte_vec({length})?;"
                ));
            }
            StringKind::FieldReferenced => {
                let length_field = string.length_field.as_ref().expect("validated");
                let src = self.decode_length_source(length_field, locals, has_ctx);
                b.line(format!("let __len = ({src}) as usize;"));
                b.line(format!(
                    "let __bytes = {stream_var}.read_byte_vec(__len)?;"
                ));
            }
        }
        match string.encoding {
            StringEncoding::Utf8 => {
                b.line("String::from_utf8(__bytes)?");
            }
            StringEncoding::Ascii => {
                b.line("let __s = String::from_utf8(__bytes)?;");
                b.open("if !__s.is_ascii()");
                b.line(format!(
                    "return Err(CodecError::InvalidValue(\"non-ASCII string in \
                     '{owner}.{field_name}'\".into()));"
                ));
                b.close();
                b.line("__s");
            }
            StringEncoding::Latin1 => {
                b.line("__bytes.iter().map(|&__b| __b as char).collect::<String>()");
            }
        }
        b.close_with("};");
        Ok(())
    }

    /// Array decode: kind-specific framing around the item loop.
    #[allow(clippy::too_many_arguments)]
    fn emit_read_array(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        array: &ArrayType,
        dest: &str,
        stream_var: &str,
        has_ctx: bool,
        locals: &[String],
    ) -> Result<(), SchemaError> {
        let bytes = is_byte_item(&array.items);

        // Byte-valued arrays with a known byte count read in one shot.
        if bytes {
            match array.kind {
                ArrayKind::LengthPrefixed | ArrayKind::ByteLengthPrefixed => {
                    let prefix = array.prefix.as_ref().expect("validated");
                    b.line(format!("let {dest} = {{"));
                    b.indent();
                    b.line(format!(
                        "let __len = {stream_var}.read_u{}({})? as usize;",
                        prefix.width,
                        self.order_expr(prefix.endianness)
                    ));
                    b.line(format!("{stream_var}.read_byte_vec(__len)?"));
                    b.close_with("};");
                    return Ok(());
                }
                ArrayKind::Fixed => {
                    let count = array.count.expect("validated");
                    b.line(format!(
                        "let {dest} = {stream_var}.read_byte_vec({count})?;"
                    ));
                    return Ok(());
                }
                ArrayKind::FieldReferenced
                | ArrayKind::ComputedCount
                | ArrayKind::ByteBudgeted => {
                    let length_field = array.length_field.as_ref().expect("validated");
                    let src = self.decode_length_source(length_field, locals, has_ctx);
                    b.line(format!("let {dest} = {{"));
                    b.indent();
                    b.line(format!("let __len = ({src}) as usize;"));
                    b.line(format!("{stream_var}.read_byte_vec(__len)?"));
                    b.close_with("};");
                    return Ok(());
                }
                ArrayKind::EofTerminated => {
                    b.line(format!("let {dest} = {{"));
                    b.indent();
                    b.line(format!(
                        "let __len = {stream_var}.remaining_bytes()?;"
                    ));
                    b.line(format!("{stream_var}.read_byte_vec(__len)?"));
                    b.close_with("};");
                    return Ok(());
                }
                _ => {}
            }
        }

        b.line(format!("let {dest} = {{"));
        b.indent();
        b.line("let mut __items = Vec::new();");

        match array.kind {
            ArrayKind::LengthPrefixed => {
                let prefix = array.prefix.as_ref().expect("validated");
                b.line(format!(
                    "let __count = {stream_var}.read_u{}({})? as usize;",
                    prefix.width,
                    self.order_expr(prefix.endianness)
                ));
                b.open("for _ in 0..__count");
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
            ArrayKind::ByteLengthPrefixed => {
                let prefix = array.prefix.as_ref().expect("validated");
                b.line(format!(
                    "let __nbytes = {stream_var}.read_u{}({})? as usize;",
                    prefix.width,
                    self.order_expr(prefix.endianness)
                ));
                b.line(format!(
                    "let __end = {stream_var}.position()? + __nbytes;"
                ));
                b.open(format!("while {stream_var}.position()? < __end"));
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
            ArrayKind::LengthPrefixedItems => {
                let prefix = array.prefix.as_ref().expect("validated");
                b.open(format!("while {stream_var}.remaining_bytes()? > 0"));
                b.line(format!(
                    "let __nbytes = {stream_var}.read_u{}({})? as usize;",
                    prefix.width,
                    self.order_expr(prefix.endianness)
                ));
                b.line(format!(
                    "let __body = {stream_var}.read_byte_vec(__nbytes)?;"
                ));
                b.line(format!(
                    "let mut __isub_buf = BitStreamDecoder::new(&__body, {});",
                    self.bit_order_expr()
                ));
                b.line("let __isub = &mut __isub_buf;");
                self.emit_array_item_read(b, owner, field_name, array, "__isub", has_ctx, locals)?;
                b.close();
            }
            ArrayKind::Fixed => {
                let count = array.count.expect("validated");
                b.open(format!("for _ in 0..{count}"));
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
            ArrayKind::FieldReferenced | ArrayKind::ComputedCount => {
                let length_field = array.length_field.as_ref().expect("validated");
                let src = self.decode_length_source(length_field, locals, has_ctx);
                b.line(format!("let __count = ({src}) as usize;"));
                b.open("for _ in 0..__count");
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
            ArrayKind::ByteBudgeted => {
                let length_field = array.length_field.as_ref().expect("validated");
                let src = self.decode_length_source(length_field, locals, has_ctx);
                b.line(format!("let __budget = ({src}) as usize;"));
                b.line(format!(
                    "let __end = {stream_var}.position()? + __budget;"
                ));
                b.open(format!("while {stream_var}.position()? < __end"));
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
            ArrayKind::NullTerminated => {
                b.open("loop");
                b.open(format!(
                    "if {stream_var}.peek_u8(ByteOrder::Big)? == 0"
                ));
                b.line(format!("let _ = {stream_var}.read_u8(ByteOrder::Big)?;"));
                b.line("break;");
                b.close();
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
            ArrayKind::EofTerminated => {
                b.open(format!("while {stream_var}.remaining_bytes()? > 0"));
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
            ArrayKind::VariantTerminated => {
                let terminator = array.terminator.as_ref().expect("validated");
                let enum_name = match &array.items {
                    FieldType::Choice(choice) => {
                        self.choice_enum_name(owner, field_name, &choice.variants, View::Output)
                    }
                    FieldType::TypeRef(type_ref) => {
                        let (resolved, _) = self
                            .schema
                            .resolve_alias(&type_ref.target)
                            .ok_or_else(|| SchemaError::UndefinedType {
                                referenced: type_ref.target.clone(),
                                referrer: owner.to_string(),
                            })?;
                        self.view_type_name(resolved, View::Output)
                    }
                    _ => {
                        return Err(SchemaError::Unsupported(format!(
                            "variant_terminated array of unnamed items \
                             ('{field_name}' in '{owner}')"
                        )))
                    }
                };
                b.open("loop");
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.line(format!(
                    "let __stop = matches!(__items.last(), Some({enum_name}::{}(_)));",
                    type_name(terminator)
                ));
                b.line("if __stop { break; }");
                b.close();
            }
            ArrayKind::SignatureTerminated => {
                let signature = array.signature.as_ref().expect("validated");
                let literal = signature
                    .iter()
                    .map(|byte| format!("{byte:#x}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                b.line(format!("let __sig: &[u8] = &[{literal}];"));
                b.open(format!(
                    "while {stream_var}.peek_byte_vec({})?.as_deref() == Some(__sig)",
                    signature.len()
                ));
                self.emit_array_item_read(b, owner, field_name, array, stream_var, has_ctx, locals)?;
                b.close();
            }
        }

        b.line("__items");
        b.close_with("};");
        Ok(())
    }

    /// One `__items.push(..)` round of the item loop.
    #[allow(clippy::too_many_arguments)]
    fn emit_array_item_read(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        array: &ArrayType,
        stream_var: &str,
        has_ctx: bool,
        locals: &[String],
    ) -> Result<(), SchemaError> {
        self.emit_read_shape(
            b,
            owner,
            field_name,
            &array.items,
            "__elem",
            stream_var,
            has_ctx,
            locals,
        )?;
        b.line("__items.push(__elem);");
        Ok(())
    }

    /// Probe the pointer marker; chase the offset or decode inline. The
    /// cursor is restored after a chase.
    #[allow(clippy::too_many_arguments)]
    fn emit_read_back_reference(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field_name: &str,
        back_ref: &BackReferenceType,
        dest: &str,
        stream_var: &str,
        has_ctx: bool,
        locals: &[String],
    ) -> Result<(), SchemaError> {
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

        b.line(format!("let {dest} = {{"));
        b.indent();
        b.line(format!(
            "let __probe = u64::from({stream_var}.peek_u{width}({order})?);"
        ));
        b.open(format!("if __probe & {marker:#x}u64 == {marker:#x}u64"));
        b.line(format!("let __here = {stream_var}.position()?;"));
        b.line(format!(
            "let __pointer = u64::from({stream_var}.read_u{width}({order})?);"
        ));
        match back_ref.origin {
            OffsetOrigin::MessageStart => {
                b.line(format!("let __target = (__pointer & {mask:#x}u64) as usize;"));
            }
            OffsetOrigin::CurrentPosition => {
                b.line(format!(
                    "let __rel = (__pointer & {mask:#x}u64) as usize;"
                ));
                b.open("if __rel == 0 || __rel > __here");
                b.line(
                    "return Err(CodecError::InvalidBackReference { offset: __rel, \
                     position: __here });",
                );
                b.close();
                b.line("let __target = __here - __rel;");
            }
        }
        b.open("if __target >= __here");
        b.line(
            "return Err(CodecError::InvalidBackReference { offset: __target, \
             position: __here });",
        );
        b.close();
        b.line(format!("let __saved = {stream_var}.position()?;"));
        b.line(format!("{stream_var}.seek(__target)?;"));
        let call = self.prep_nested_decode(b, resolved, stream_var, locals, has_ctx);
        b.line(format!("let __value = {call}?;"));
        b.line(format!("{stream_var}.seek(__saved)?;"));
        b.line("__value");
        b.close_with("} else {");
        b.indent();
        let call = self.prep_nested_decode(b, resolved, stream_var, locals, has_ctx);
        b.line(format!("{call}?"));
        b.close_with("}");
        b.close_with("};");
        Ok(())
    }

    pub(crate) fn emit_union_decode(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        union: &UnionType,
    ) -> Result<(), SchemaError> {
        let facts = self.facts.get(owner);
        let has_ctx = facts.needs_decode_context;
        let output_name = self.view_type_name(owner, View::Output);

        b.open(format!("impl {output_name}"));

        b.line("/// Decodes one variant from the wire bytes.");
        b.open("pub fn decode(bytes: &[u8]) -> CodecResult<Self>");
        b.line(format!(
            "let mut stream = BitStreamDecoder::new(bytes, {});",
            self.bit_order_expr()
        ));
        b.line("Self::decode_with_stream(&mut stream)");
        b.close();
        b.blank();

        if has_ctx {
            b.open(
                "pub fn decode_with_stream(stream: &mut BitStreamDecoder<'_>) -> CodecResult<Self>",
            );
            b.line("let ctx = DecodeContext::new();");
            b.line("Self::decode_with_stream_and_context(stream, &ctx)");
            b.close();
            b.blank();
            b.open(
                "pub fn decode_with_stream_and_context(stream: &mut BitStreamDecoder<'_>, \
                 ctx: &DecodeContext) -> CodecResult<Self>",
            );
        } else {
            b.open(
                "pub fn decode_with_stream(stream: &mut BitStreamDecoder<'_>) -> CodecResult<Self>",
            );
        }

        match &union.discriminator {
            Discriminator::Peek { int } => {
                b.line(format!(
                    "let __disc = u64::from(stream.peek_u{}({})?);",
                    int.width,
                    self.order_expr(int.endianness)
                ));
            }
            Discriminator::Field { name } => {
                b.line(format!("let __disc = ctx.require(\"{name}\")?;"));
            }
        }

        let mut fallback: Option<&str> = None;
        for variant in &union.variants {
            let Some(when) = &variant.when else {
                if fallback.is_none() {
                    fallback = Some(&variant.type_name);
                }
                continue;
            };
            let variant_ident = type_name(&variant.type_name);
            let (resolved, _) = self
                .schema
                .resolve_alias(&variant.type_name)
                .ok_or_else(|| SchemaError::UndefinedType {
                    referenced: variant.type_name.clone(),
                    referrer: owner.to_string(),
                })?;
            b.open(format!(
                "if __disc {} {}u64",
                when.op.as_rust(),
                when.value
            ));
            let call = self.prep_nested_decode(b, resolved, "stream", &[], has_ctx);
            b.line(format!("return Ok(Self::{variant_ident}({call}?));"));
            b.close();
        }

        match fallback {
            Some(fallback_type) => {
                let variant_ident = type_name(fallback_type);
                let (resolved, _) = self
                    .schema
                    .resolve_alias(fallback_type)
                    .ok_or_else(|| SchemaError::UndefinedType {
                        referenced: fallback_type.to_string(),
                        referrer: owner.to_string(),
                    })?;
                let call = self.prep_nested_decode(b, resolved, "stream", &[], has_ctx);
                b.line(format!("Ok(Self::{variant_ident}({call}?))"));
            }
            None => {
                b.line(format!(
                    "Err(CodecError::NoVariantMatched(\"{owner}\".into()))"
                ));
            }
        }

        b.close();
        b.close();
        b.blank();
        Ok(())
    }

    /// Prepares a nested decode call, building a child `DecodeContext` when
    /// the child declares context fields. Returns the call expression.
    fn prep_nested_decode(
        &self,
        b: &mut CodeBuilder,
        resolved: &str,
        stream_var: &str,
        locals: &[String],
        has_ctx: bool,
    ) -> String {
        let out_name = self.view_type_name(resolved, View::Output);
        let child = self.facts.get(resolved);
        if child.needs_decode_context {
            b.line("let mut __child_ctx = DecodeContext::new();");
            for name in child.decode_context_fields.clone() {
                let src = self.decode_length_source(&name, locals, has_ctx);
                b.line(format!("__child_ctx.insert(\"{name}\", {src});"));
            }
            format!("{out_name}::decode_with_stream_and_context({stream_var}, &__child_ctx)")
        } else {
            format!("{out_name}::decode_with_stream({stream_var})")
        }
    }

    /// Source expression for a length/budget/discriminator value: a local
    /// decoded variable when the frame declares it, the decode context
    /// otherwise (the analyzer guarantees the frame receives the field).
    fn decode_length_source(&self, name: &str, locals: &[String], _has_ctx: bool) -> String {
        let plain = name.trim_start_matches("../");
        if !name.starts_with("../") && locals.iter().any(|local| local == plain) {
            format!("({}) as u64", field_ident(plain))
        } else {
            format!("ctx.require(\"{plain}\")?")
        }
    }

    /// Subject expression for a conditional predicate at decode.
    fn predicate_subject_decode(&self, predicate: &Predicate, locals: &[String]) -> String {
        let name = &predicate.field;
        let plain = name.trim_start_matches("../");
        if !name.starts_with("../") && locals.iter().any(|local| local == plain) {
            format!("(({}) as u64)", field_ident(plain))
        } else {
            format!("ctx.require(\"{plain}\")?")
        }
    }

    /// Emits the const-mismatch rejection for a decoded literal field.
    fn emit_const_validation(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        field: &Field,
        const_value: &ConstValue,
    ) -> Result<(), SchemaError> {
        let ident = field_ident(&field.name);
        let (comparison, expected) = match const_value {
            ConstValue::Uint(value) => (format!("{ident} != {value:#x}"), format!("{value:#x}")),
            ConstValue::Int(value) => (format!("{ident} != {value}"), format!("{value}")),
            ConstValue::Str(value) => (format!("{ident} != \"{value}\""), format!("\"{value}\"")),
            ConstValue::Bytes(bytes) => {
                let literal = bytes
                    .iter()
                    .map(|byte| format!("{byte:#x}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                (
                    format!("{ident} != [{literal}u8].as_slice()"),
                    format!("{bytes:02x?}"),
                )
            }
        };
        b.open(format!("if {comparison}"));
        b.open("return Err(CodecError::ConstMismatch");
        b.line(format!("field: \"{owner}.{}\".into(),", field.name));
        b.line(format!("expected: \"{}\".into(),", expected.replace('"', "\\\"")));
        b.line(format!("actual: format!(\"{{:?}}\", {ident}),"));
        b.close_with("});");
        b.close();
        Ok(())
    }
}
