//! Expression emission for `computed` fields.
//!
//! Every computed kind resolves against one of three target cases the
//! analyzer distinguishes: a sibling in the same frame (direct access on
//! `self`), an ancestor frame (context lookup), or an array selector
//! (position map / materialized items). The emitted expression always
//! evaluates to `u64`; the caller casts to the field's wire width.
//!
//! Context lookups tolerate measurement passes: during a pre-pass or a
//! two-pass length measurement, position and item state may not exist yet,
//! so the emitted code substitutes zero (the field widths are what the
//! measurement needs) and only fails on a real pass.

use super::builder::CodeBuilder;
use super::names::{field_ident, tracking_key};
use super::{Generator, ResolvedShape};
use crate::schema::{
    ComputedSpec, CompositeType, Field, FieldType, SchemaError, Selector, TargetPath,
};

impl Generator<'_> {
    /// Emits any preamble statements a computed field needs and returns the
    /// `u64` expression for its value.
    pub(crate) fn emit_computed_value(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
        field: &Field,
        has_ctx: bool,
    ) -> Result<String, SchemaError> {
        let spec = field
            .computed
            .as_ref()
            .expect("emit_computed_value called on a non-computed field");
        let tag = field_ident(&field.name);

        match spec {
            ComputedSpec::LengthOf { target, .. } => {
                let path = TargetPath::parse(target)?;
                self.emit_length_expr(b, owner, composite, &path, has_ctx, &tag)
            }
            ComputedSpec::CountOf { target } => {
                let path = TargetPath::parse(target)?;
                if path.selector.is_some() {
                    return Err(SchemaError::Unsupported(format!(
                        "count_of through a selector ('{target}' in '{owner}')"
                    )));
                }
                match self.target_access(composite, &path) {
                    TargetAccess::Local(local) => {
                        let ident = field_ident(&local.name);
                        match &local.ty {
                            FieldType::Array(_) => Ok(format!("(self.{ident}.len() as u64)")),
                            _ => Err(SchemaError::Unsupported(format!(
                                "count_of a non-array sibling ('{target}' in '{owner}')"
                            ))),
                        }
                    }
                    access => Ok(self.emit_ctx_lookup(
                        b,
                        &tag,
                        &access.option_expr(&path.field),
                        "__v.len() as u64",
                        &missing_context(&path.field),
                    )),
                }
            }
            ComputedSpec::Crc32Of { target, through } => {
                let path = TargetPath::parse(target)?;
                if let Some(through) = through {
                    return self.emit_crc_span(b, owner, composite, &path, through, has_ctx, &tag);
                }
                match self.target_access(composite, &path) {
                    TargetAccess::Local(local) => {
                        let ident = field_ident(&local.name);
                        match self.resolve_shape(&local.ty)? {
                            ResolvedShape::Inline(FieldType::String(_)) => {
                                Ok(format!("u64::from(crc32(self.{ident}.as_bytes()))"))
                            }
                            ResolvedShape::Inline(FieldType::Array(array))
                                if super::is_byte_item(&array.items) =>
                            {
                                Ok(format!("u64::from(crc32(&self.{ident}))"))
                            }
                            _ => {
                                self.emit_measure_field(
                                    b,
                                    owner,
                                    composite,
                                    local,
                                    &format!("__crc_bytes_{tag}"),
                                    has_ctx,
                                )?;
                                Ok(format!("u64::from(crc32(&__crc_bytes_{tag}))"))
                            }
                        }
                    }
                    // Rejected by the analyzer: snapshot numerics drop their
                    // wire width, so a cross-frame CRC cannot reproduce the
                    // encoded bytes.
                    TargetAccess::Ancestor(_) | TargetAccess::ParentSearch => {
                        Err(SchemaError::Unsupported(format!(
                            "crc32_of a non-sibling target ('{target}' in '{owner}')"
                        )))
                    }
                }
            }
            ComputedSpec::PositionOf { target } => {
                let path = TargetPath::parse(target)?;
                match &path.selector {
                    None => {
                        // The `__pos_` binding only exists in the frame that
                        // captured it; ancestor targets without a selector
                        // are rejected by the analyzer.
                        if path.ascend > 0 {
                            return Err(SchemaError::Unsupported(format!(
                                "position_of an ancestor field without a selector \
                                 ('{target}' in '{owner}')"
                            )));
                        }
                        let ident = field_ident(&path.field);
                        Ok(format!("(__pos_{ident} as u64)"))
                    }
                    Some(Selector::First(ty)) => {
                        let key = tracking_key(&path.field, ty);
                        Ok(self.emit_ctx_lookup(
                            b,
                            &tag,
                            &format!("ctx.first_position(\"{key}\")"),
                            "__v as u64",
                            &missing_position(&key),
                        ))
                    }
                    Some(Selector::Last(ty)) => {
                        let key = tracking_key(&path.field, ty);
                        Ok(self.emit_ctx_lookup(
                            b,
                            &tag,
                            &format!("ctx.last_position(\"{key}\")"),
                            "__v as u64",
                            &missing_position(&key),
                        ))
                    }
                    Some(Selector::Corresponding(ty)) => {
                        let key = tracking_key(&path.field, ty);
                        self.emit_corresponding_index(b, owner, &path.field, &tag);
                        Ok(self.emit_ctx_lookup(
                            b,
                            &tag,
                            &format!("ctx.nth_position(\"{key}\", __corr_{tag})"),
                            "__v as u64",
                            &missing_position(&key),
                        ))
                    }
                }
            }
            ComputedSpec::SumOfSizes { targets } => {
                let mut parts = Vec::with_capacity(targets.len());
                for (index, target) in targets.iter().enumerate() {
                    let path = TargetPath::parse(target)?;
                    let part = self.emit_length_expr(
                        b,
                        owner,
                        composite,
                        &path,
                        has_ctx,
                        &format!("{tag}_{index}"),
                    )?;
                    parts.push(part);
                }
                Ok(format!("({})", parts.join(" + ")))
            }
            ComputedSpec::SumOfTypeSizes { array, type_name } => {
                let path = TargetPath::parse(array)?;
                match self.target_access(composite, &path) {
                    TargetAccess::Local(local) => self.emit_local_sum_of_type_sizes(
                        b, owner, composite, local, type_name, &tag,
                    ),
                    access => Ok(self.emit_ctx_lookup(
                        b,
                        &tag,
                        &access.option_expr(&path.field),
                        &format!("__v.sum_type_sizes(\"{type_name}\") as u64"),
                        &missing_context(&path.field),
                    )),
                }
            }
        }
    }

    /// CRC over the encoded bytes of a contiguous run of siblings, from the
    /// target field through the named end field inclusive.
    fn emit_crc_span(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
        path: &TargetPath,
        through: &str,
        has_ctx: bool,
        tag: &str,
    ) -> Result<String, SchemaError> {
        if path.ascend > 0 || path.selector.is_some() {
            return Err(SchemaError::Unsupported(format!(
                "crc32_of with 'through' takes same-frame fields only \
                 ('{}' in '{owner}')",
                path.field
            )));
        }
        let start = composite
            .sequence
            .iter()
            .position(|field| field.name == path.field);
        let end = composite
            .sequence
            .iter()
            .position(|field| field.name == through);
        let (Some(start), Some(end)) = (start, end) else {
            return Err(SchemaError::Unsupported(format!(
                "crc32_of span '{}'..'{through}' names a missing sibling in '{owner}'",
                path.field
            )));
        };
        if start > end {
            return Err(SchemaError::Unsupported(format!(
                "crc32_of span '{}'..'{through}' is reversed in '{owner}'",
                path.field
            )));
        }

        b.line(format!("let __crc_bytes_{tag} = {{"));
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
        for field in &composite.sequence[start..=end] {
            if field.computed.is_some() {
                return Err(SchemaError::Unsupported(format!(
                    "crc32_of span covers computed field '{}' in '{owner}'",
                    field.name
                )));
            }
            if let Some(const_value) = &field.const_value {
                self.emit_write_const(b, owner, field, const_value, "__tmp")?;
            } else {
                self.emit_write_field(b, owner, field, "__tmp", has_ctx, false)?;
            }
        }
        b.line("__tmp_buf.finish()");
        b.close_with("};");
        Ok(format!("u64::from(crc32(&__crc_bytes_{tag}))"))
    }

    /// Length expression for one target path (shared by `length_of` and
    /// `sum_of_sizes`).
    fn emit_length_expr(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        composite: &CompositeType,
        path: &TargetPath,
        has_ctx: bool,
        tag: &str,
    ) -> Result<String, SchemaError> {
        if let Some(selector) = &path.selector {
            let arr = &path.field;
            return Ok(match selector {
                Selector::First(ty) => self.emit_ctx_lookup(
                    b,
                    tag,
                    &format!(
                        "ctx.find_parent_field(\"{arr}\")\
                         .and_then(|__f| __f.nth_item_of_type(\"{ty}\", 0))"
                    ),
                    "__v.encoded_size as u64",
                    &missing_item(ty),
                ),
                Selector::Last(ty) => self.emit_ctx_lookup(
                    b,
                    tag,
                    &format!(
                        "ctx.find_parent_field(\"{arr}\")\
                         .and_then(|__f| __f.last_item_of_type(\"{ty}\"))"
                    ),
                    "__v.encoded_size as u64",
                    &missing_item(ty),
                ),
                Selector::Corresponding(ty) => {
                    self.emit_corresponding_index(b, owner, arr, tag);
                    self.emit_ctx_lookup(
                        b,
                        tag,
                        &format!(
                            "ctx.find_parent_field(\"{arr}\")\
                             .and_then(|__f| __f.nth_item_of_type(\"{ty}\", __corr_{tag}))"
                        ),
                        "__v.encoded_size as u64",
                        &missing_item(ty),
                    )
                }
            });
        }

        match self.target_access(composite, path) {
            TargetAccess::Local(local) => {
                let ident = field_ident(&local.name);
                match self.resolve_shape(&local.ty)? {
                    ResolvedShape::Inline(FieldType::String(_)) => {
                        Ok(format!("(self.{ident}.len() as u64)"))
                    }
                    ResolvedShape::Inline(FieldType::Array(array))
                        if super::is_byte_item(&array.items) =>
                    {
                        Ok(format!("(self.{ident}.len() as u64)"))
                    }
                    ResolvedShape::Inline(
                        FieldType::Uint(_)
                        | FieldType::Int(_)
                        | FieldType::Bits(_)
                        | FieldType::Varlength(_),
                    ) => Ok(format!("((self.{ident}) as u64)")),
                    _ => {
                        let var = format!("__len_bytes_{tag}");
                        self.emit_measure_field(b, owner, composite, local, &var, has_ctx)?;
                        Ok(format!("({var}.len() as u64)"))
                    }
                }
            }
            access => Ok(self.emit_ctx_lookup(
                b,
                tag,
                &access.option_expr(&path.field),
                "__v.length_of_value() as u64",
                &missing_context(&path.field),
            )),
        }
    }

    /// `sum_of_type_sizes` over an array in the current frame: measure each
    /// matching element.
    fn emit_local_sum_of_type_sizes(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        _composite: &CompositeType,
        local: &Field,
        type_name: &str,
        tag: &str,
    ) -> Result<String, SchemaError> {
        let ident = field_ident(&local.name);
        let FieldType::Array(array) = &local.ty else {
            return Err(SchemaError::Unsupported(format!(
                "sum_of_type_sizes over a non-array sibling ('{}' in '{owner}')",
                local.name
            )));
        };
        let FieldType::Choice(choice) = &array.items else {
            return Err(SchemaError::Unsupported(format!(
                "sum_of_type_sizes over an array without variant items \
                 ('{}' in '{owner}')",
                local.name
            )));
        };
        let enum_name =
            self.choice_enum_name(owner, &local.name, &choice.variants, super::View::Input);
        let variant = super::names::type_name(type_name);
        let (resolved, _) = self
            .schema
            .resolve_alias(type_name)
            .ok_or_else(|| SchemaError::UndefinedType {
                referenced: type_name.to_string(),
                referrer: owner.to_string(),
            })?;

        b.line(format!("let __type_sum_{tag} = {{"));
        b.indent();
        b.line("let mut __acc = 0usize;");
        b.open(format!("for __item in &self.{ident}"));
        b.open(format!("if let {enum_name}::{variant}(__v) = __item"));
        self.emit_measure_named(b, resolved, "__v", "__v_bytes", false)?;
        b.line("__acc += __v_bytes.len();");
        b.close();
        b.close();
        b.line("__acc as u64");
        b.close_with("};");
        Ok(format!("__type_sum_{tag}"))
    }

    /// Shared `corresponding` slot computation: the own-type occurrence
    /// counter for same-array correlation, the current cross-array index
    /// otherwise.
    pub(crate) fn emit_corresponding_index(
        &self,
        b: &mut CodeBuilder,
        owner: &str,
        array_field: &str,
        tag: &str,
    ) {
        let own_key = tracking_key(array_field, owner);
        b.line(format!(
            "let __corr_{tag} = if ctx.is_current_array(\"{array_field}\") {{"
        ));
        b.indent();
        b.line(format!("ctx.type_index(\"{own_key}\").saturating_sub(1)"));
        b.close_with("} else {");
        b.indent();
        b.line("ctx.current_iteration().map(|(_, __i)| __i).unwrap_or(0)");
        b.close_with("};");
    }

    /// Context lookup with the measurement fallback: a missing value during
    /// a measurement pass reads as zero, a missing value during a real pass
    /// is an error. Returns the bound variable name.
    fn emit_ctx_lookup(
        &self,
        b: &mut CodeBuilder,
        tag: &str,
        option_expr: &str,
        extract: &str,
        err_expr: &str,
    ) -> String {
        let var = format!("__ctx_val_{tag}");
        b.line(format!("let {var} = match {option_expr} {{"));
        b.indent();
        b.line(format!("Some(__v) => {extract},"));
        b.line("None if ctx.is_measuring() => 0,");
        b.line(format!("None => return Err({err_expr}),"));
        b.close_with("};");
        var
    }

    /// Classifies where a plain target path resolves.
    fn target_access<'c>(
        &self,
        composite: &'c CompositeType,
        path: &TargetPath,
    ) -> TargetAccess<'c> {
        if path.ascend == 0 {
            if let Some(local) = composite
                .sequence
                .iter()
                .find(|field| field.name == path.field)
            {
                return TargetAccess::Local(local);
            }
            return TargetAccess::ParentSearch;
        }
        TargetAccess::Ancestor(path.ascend)
    }
}

enum TargetAccess<'c> {
    /// A sibling of the computed field; read straight off `self`.
    Local(&'c Field),
    /// An explicit `../` path; indexed parent-frame lookup.
    Ancestor(usize),
    /// A plain name that is not a sibling; outermost-first frame search.
    ParentSearch,
}

impl TargetAccess<'_> {
    /// Context expression yielding an `Option<&FieldValue>` for the target.
    fn option_expr(&self, field: &str) -> String {
        match self {
            TargetAccess::Local(_) => unreachable!("local targets never hit the context"),
            TargetAccess::Ancestor(levels) => {
                format!("ctx.parent_field({levels}, \"{field}\")")
            }
            TargetAccess::ParentSearch => format!("ctx.find_parent_field(\"{field}\")"),
        }
    }
}

fn missing_context(field: &str) -> String {
    format!("CodecError::MissingContext(\"{field}\".into())")
}

fn missing_position(key: &str) -> String {
    format!("CodecError::InvalidValue(\"no tracked position for '{key}'\".into())")
}

fn missing_item(type_name: &str) -> String {
    format!("CodecError::InvalidValue(\"no corresponding '{type_name}' item\".into())")
}
