//! Classifies every schema type so codegen can pick an emission strategy
//! without repeating the analysis.
//!
//! For each type the analyzer decides: whether the caller-facing shape
//! splits into Input/Output views, whether encode or decode calls must
//! thread a context, whether a compression dictionary has to exist for the
//! message, and which arrays need a position pre-pass.

use indexmap::IndexMap;

use crate::schema::{
    walk_field_type, ArrayKind, ComputedSpec, Discriminator, FieldType, Schema, SchemaError,
    StringKind, TargetPath, TypeDef,
};

/// Classification of one schema type.
#[derive(Debug, Default, Clone)]
pub struct TypeFacts {
    /// The sequence contains a `computed` or `const` field, so the caller
    /// supplies an Input shape and decode returns an Output shape.
    pub split_views: bool,
    /// Encoding this type requires an [`crate::runtime::EncodeContext`]:
    /// ancestor or selector computed targets, a nested type that needs one,
    /// or a back-reference anywhere beneath it.
    pub needs_encode_context: bool,
    /// Decoding this type requires a [`crate::runtime::DecodeContext`].
    pub needs_decode_context: bool,
    /// Field names this type's decoder expects in its decode context.
    pub decode_context_fields: Vec<String>,
    /// A back-reference occurs in this type or anything it nests; governs
    /// compression-dictionary threading.
    pub contains_back_reference: bool,
    /// Array field name → variant type names whose positions must be
    /// recorded by a pre-pass before the array encodes.
    pub tracked_arrays: IndexMap<String, Vec<String>>,
}

/// Classification of every type in a schema, in declaration order.
#[derive(Debug)]
pub struct SchemaFacts {
    pub types: IndexMap<String, TypeFacts>,
}

impl SchemaFacts {
    pub fn get(&self, name: &str) -> &TypeFacts {
        &self.types[name]
    }
}

/// Runs the full analysis. The schema is assumed structurally valid
/// (`Schema::from_yaml` has already run its checks).
pub fn analyze(schema: &Schema) -> Result<SchemaFacts, SchemaError> {
    check_unsupported(schema)?;

    let mut facts: IndexMap<String, TypeFacts> = schema
        .types
        .iter()
        .map(|(name, def)| (name.clone(), local_facts(def)))
        .collect();

    let local_names: IndexMap<&str, Vec<&str>> = schema
        .types
        .iter()
        .map(|(name, def)| {
            let names = match def {
                TypeDef::Composite(composite) => composite
                    .sequence
                    .iter()
                    .map(|field| field.name.as_str())
                    .collect(),
                _ => Vec::new(),
            };
            (name.as_str(), names)
        })
        .collect();

    // Transitive properties settle by fixpoint so that type graphs which
    // recurse through arrays or optionals terminate.
    loop {
        let mut changed = false;
        for name in schema.types.keys() {
            let refs = referenced_types(&schema.types[name]);
            let mut needs_encode = facts[name].needs_encode_context;
            let mut has_back_ref = facts[name].contains_back_reference;
            let mut split = facts[name].split_views;
            let mut inherited_decode_fields: Vec<String> = Vec::new();

            for referenced in &refs {
                if let Some(nested) = facts.get(referenced.as_str()) {
                    needs_encode |= nested.needs_encode_context;
                    has_back_ref |= nested.contains_back_reference;
                    // A nested split type makes the nesting type's field
                    // shapes differ between views, so the split is
                    // contagious (unions likewise split when a variant
                    // payload splits).
                    split |= nested.split_views;
                    // A length field the child expects but this type does
                    // not declare must come from this type's own context.
                    for field in &nested.decode_context_fields {
                        if !local_names[name.as_str()].contains(&field.as_str()) {
                            inherited_decode_fields.push(field.clone());
                        }
                    }
                }
            }
            needs_encode |= has_back_ref;

            let entry = &mut facts[name];
            changed |= entry.needs_encode_context != needs_encode
                || entry.contains_back_reference != has_back_ref
                || entry.split_views != split;
            entry.needs_encode_context = needs_encode;
            entry.contains_back_reference = has_back_ref;
            entry.split_views = split;
            for field in inherited_decode_fields {
                if !entry.decode_context_fields.contains(&field) {
                    entry.decode_context_fields.push(field);
                    entry.needs_decode_context = true;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    collect_tracked_arrays(schema, &mut facts)?;

    Ok(SchemaFacts { types: facts })
}

fn local_facts(def: &TypeDef) -> TypeFacts {
    let mut facts = TypeFacts::default();

    match def {
        TypeDef::Composite(composite) => {
            let local_names: Vec<&str> = composite
                .sequence
                .iter()
                .map(|field| field.name.as_str())
                .collect();

            for field in &composite.sequence {
                if field.const_value.is_some() || field.computed.is_some() {
                    facts.split_views = true;
                }
                if let Some(computed) = &field.computed {
                    for raw in computed.raw_targets() {
                        // Paths were checked during schema validation. A
                        // plain name that is not a sibling resolves through
                        // the parent-frame search, which also needs context.
                        let Ok(path) = TargetPath::parse(raw) else {
                            continue;
                        };
                        if path.needs_context() || !local_names.contains(&path.field.as_str()) {
                            facts.needs_encode_context = true;
                        }
                    }
                }
                if let Some(predicate) = &field.conditional {
                    if predicate.field.starts_with("../") {
                        facts.needs_encode_context = true;
                        push_unique(
                            &mut facts.decode_context_fields,
                            predicate.field.trim_start_matches("../"),
                        );
                        facts.needs_decode_context = true;
                    }
                }
                if let Some(budget) = &field.byte_budget {
                    let plain = budget.trim_start_matches("../");
                    let is_local = !budget.starts_with("../") && local_names.contains(&plain);
                    if !is_local {
                        facts.needs_decode_context = true;
                        push_unique(&mut facts.decode_context_fields, plain);
                    }
                }

                walk_field_type(&field.ty, &mut |ty| {
                    if let FieldType::BackReference(_) = ty {
                        facts.contains_back_reference = true;
                    }
                    if let Some(length_field) = referenced_length_field(ty) {
                        let plain = length_field.trim_start_matches("../");
                        let is_local =
                            !length_field.starts_with("../") && local_names.contains(&plain);
                        if !is_local {
                            facts.needs_decode_context = true;
                            push_unique(&mut facts.decode_context_fields, plain);
                        }
                    }
                });
            }

            for instance in &composite.instances {
                walk_field_type(&instance.ty, &mut |ty| {
                    if let FieldType::BackReference(_) = ty {
                        facts.contains_back_reference = true;
                    }
                });
            }
        }
        TypeDef::Alias(alias) => {
            walk_field_type(&alias.value, &mut |ty| {
                if let FieldType::BackReference(_) = ty {
                    facts.contains_back_reference = true;
                }
            });
        }
        TypeDef::Union(union) => {
            if let Discriminator::Field { name } = &union.discriminator {
                facts.needs_decode_context = true;
                push_unique(&mut facts.decode_context_fields, name);
            }
        }
    }

    facts
}

/// The length-field a wire shape reads from scope, if any.
fn referenced_length_field(ty: &FieldType) -> Option<&str> {
    match ty {
        FieldType::String(string) if string.kind == StringKind::FieldReferenced => {
            string.length_field.as_deref()
        }
        FieldType::Array(array)
            if matches!(
                array.kind,
                ArrayKind::FieldReferenced | ArrayKind::ByteBudgeted | ArrayKind::ComputedCount
            ) =>
        {
            array.length_field.as_deref()
        }
        _ => None,
    }
}

/// Named types reachable from a definition through any field path.
fn referenced_types(def: &TypeDef) -> Vec<String> {
    let mut out = Vec::new();
    let mut collect = |ty: &FieldType| match ty {
        FieldType::TypeRef(type_ref) => out.push(type_ref.target.clone()),
        FieldType::BackReference(back_ref) => out.push(back_ref.target.clone()),
        FieldType::Choice(choice) => out.extend(choice.variants.iter().cloned()),
        _ => {}
    };

    match def {
        TypeDef::Composite(composite) => {
            for field in &composite.sequence {
                walk_field_type(&field.ty, &mut collect);
            }
            for instance in &composite.instances {
                walk_field_type(&instance.ty, &mut collect);
            }
        }
        TypeDef::Alias(alias) => walk_field_type(&alias.value, &mut collect),
        TypeDef::Union(union) => {
            out.extend(union.variants.iter().map(|v| v.type_name.clone()));
        }
    }
    out
}

/// Records, for every array field in the schema, the variant types whose
/// first/last/corresponding positions are referenced from somewhere.
fn collect_tracked_arrays(
    schema: &Schema,
    facts: &mut IndexMap<String, TypeFacts>,
) -> Result<(), SchemaError> {
    // Selector targets are keyed by array field name; the pre-pass keys its
    // position map "array__Type" globally, so tracking by name is exact.
    let mut tracked: Vec<(String, String)> = Vec::new();

    for def in schema.types.values() {
        let TypeDef::Composite(composite) = def else {
            continue;
        };
        for field in &composite.sequence {
            let Some(ComputedSpec::PositionOf { target }) = &field.computed else {
                continue;
            };
            let path = TargetPath::parse(target)?;
            if let Some(selector) = &path.selector {
                tracked.push((path.field.clone(), selector.type_name().to_string()));
            }
        }
    }

    for (type_name, def) in &schema.types {
        let TypeDef::Composite(composite) = def else {
            continue;
        };
        for field in &composite.sequence {
            if !matches!(field.ty, FieldType::Array(_)) {
                continue;
            }
            for (array_name, variant) in &tracked {
                if *array_name == field.name {
                    let entry = facts[type_name.as_str()]
                        .tracked_arrays
                        .entry(field.name.clone())
                        .or_default();
                    if !entry.contains(variant) {
                        entry.push(variant.clone());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Rejects the schema constructs the generator declines to compile.
fn check_unsupported(schema: &Schema) -> Result<(), SchemaError> {
    for (type_name, def) in &schema.types {
        let TypeDef::Composite(composite) = def else {
            continue;
        };
        for (index, field) in composite.sequence.iter().enumerate() {
            match &field.computed {
                Some(ComputedSpec::Crc32Of { target, .. }) => {
                    let path = TargetPath::parse(target)?;
                    if path.selector.is_some() {
                        return Err(SchemaError::Unsupported(format!(
                            "crc32_of through a selector ('{target}' in '{type_name}')"
                        )));
                    }
                    // Frame snapshots keep numeric values without their wire
                    // width or byte order, so a cross-frame CRC cannot
                    // reproduce the encoded bytes.
                    let is_local = path.ascend == 0
                        && composite
                            .sequence
                            .iter()
                            .any(|other| other.name == path.field);
                    if !is_local {
                        return Err(SchemaError::Unsupported(format!(
                            "crc32_of a non-sibling target ('{target}' in '{type_name}')"
                        )));
                    }
                }
                Some(ComputedSpec::PositionOf { target }) => {
                    let path = TargetPath::parse(target)?;
                    if path.selector.is_none() && path.ascend > 0 {
                        // The captured offset lives in the ancestor's own
                        // frame; the encode context has no position lookup
                        // keyed by ancestor level.
                        return Err(SchemaError::Unsupported(format!(
                            "position_of an ancestor field without a selector \
                             ('{target}' in '{type_name}')"
                        )));
                    }
                    if path.selector.is_none() && path.ascend == 0 {
                        let target_index = composite
                            .sequence
                            .iter()
                            .position(|other| other.name == path.field);
                        if target_index.map_or(false, |t| t > index) {
                            return Err(SchemaError::Unsupported(format!(
                                "position_of a later sibling without a selector \
                                 ('{target}' in '{type_name}')"
                            )));
                        }
                    }
                }
                Some(ComputedSpec::LengthOf {
                    from_after_field: Some(after),
                    ..
                }) => {
                    // The deferred buffer's final base offset is unknown
                    // while the dictionary is being filled, so pointer
                    // offsets inside the suspended range cannot be trusted.
                    let after_index = composite
                        .sequence
                        .iter()
                        .position(|other| &other.name == after);
                    if let Some(after_index) = after_index {
                        for suspended in &composite.sequence[after_index + 1..] {
                            if field_reaches_back_reference(schema, &suspended.ty) {
                                return Err(SchemaError::Unsupported(format!(
                                    "back-reference inside the content-first range after \
                                     '{after}' in '{type_name}'"
                                )));
                            }
                        }
                    } else {
                        return Err(SchemaError::InvalidField {
                            type_name: type_name.clone(),
                            field: field.name.clone(),
                            reason: format!("from_after_field '{after}' is not in the sequence"),
                        });
                    }
                }
                _ => {}
            }

        }
    }
    Ok(())
}

/// Whether the shape (or any named type it reaches) contains a
/// back-reference. Walks the type graph with a visited set; recursion
/// through arrays is fine here because repeats are skipped.
fn field_reaches_back_reference(schema: &Schema, ty: &FieldType) -> bool {
    fn visit(schema: &Schema, ty: &FieldType, seen: &mut Vec<String>) -> bool {
        let mut found = false;
        walk_field_type(ty, &mut |nested| match nested {
            FieldType::BackReference(_) => found = true,
            FieldType::TypeRef(type_ref) => {
                found |= visit_named(schema, &type_ref.target, seen);
            }
            FieldType::Choice(choice) => {
                for variant in &choice.variants {
                    found |= visit_named(schema, variant, seen);
                }
            }
            _ => {}
        });
        found
    }

    fn visit_named(schema: &Schema, name: &str, seen: &mut Vec<String>) -> bool {
        if seen.iter().any(|s| s == name) {
            return false;
        }
        seen.push(name.to_string());
        match schema.get(name) {
            Some(TypeDef::Composite(composite)) => {
                composite
                    .sequence
                    .iter()
                    .any(|field| visit(schema, &field.ty, seen))
                    || composite
                        .instances
                        .iter()
                        .any(|instance| visit(schema, &instance.ty, seen))
            }
            Some(TypeDef::Alias(alias)) => visit(schema, &alias.value, seen),
            Some(TypeDef::Union(union)) => union
                .variants
                .iter()
                .any(|variant| visit_named(schema, &variant.type_name, seen)),
            None => false,
        }
    }

    visit(schema, ty, &mut Vec::new())
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn analyze_yaml(yaml: &str) -> SchemaFacts {
        let schema = Schema::from_yaml(yaml).expect("schema should parse");
        analyze(&schema).expect("analysis should succeed")
    }

    #[test]
    fn plain_composite_has_no_needs() {
        let facts = analyze_yaml(
            r#"
            types:
              point:
                kind: composite
                sequence:
                  - { name: x, type: uint, width: 16 }
                  - { name: y, type: uint, width: 16 }
            "#,
        );
        let point = facts.get("point");
        assert!(!point.split_views);
        assert!(!point.needs_encode_context);
        assert!(!point.needs_decode_context);
        assert!(!point.contains_back_reference);
    }

    #[test]
    fn const_or_computed_splits_views() {
        let facts = analyze_yaml(
            r#"
            types:
              chunk:
                kind: composite
                sequence:
                  - { name: magic, type: uint, width: 32, const: 0x1234 }
                  - { name: body, type: uint, width: 8 }
            "#,
        );
        assert!(facts.get("chunk").split_views);
        // A same-frame const does not force a context.
        assert!(!facts.get("chunk").needs_encode_context);
    }

    #[test]
    fn ancestor_target_needs_encode_context() {
        let facts = analyze_yaml(
            r#"
            types:
              inner:
                kind: composite
                sequence:
                  - name: len_payload
                    type: uint
                    width: 16
                    computed: { kind: length_of, target: ../payload }
              outer:
                kind: composite
                sequence:
                  - { name: payload, type: string, kind: null_terminated }
                  - { name: header, type: type_ref, target: inner }
            "#,
        );
        assert!(facts.get("inner").needs_encode_context);
        // Nesting a context-needing type is contagious.
        assert!(facts.get("outer").needs_encode_context);
    }

    #[test]
    fn back_reference_is_transitively_contagious() {
        let facts = analyze_yaml(
            r#"
            types:
              label_seq:
                kind: composite
                sequence:
                  - { name: len, type: uint, width: 8 }
              name:
                kind: alias
                value:
                  type: back_reference
                  target: label_seq
                  storage: { width: 16 }
                  mask: 0x3FFF
              question:
                kind: composite
                sequence:
                  - { name: qname, type: type_ref, target: name }
              message:
                kind: composite
                sequence:
                  - name: questions
                    type: array
                    kind: fixed
                    count: 2
                    items: { type: type_ref, target: question }
            "#,
        );
        assert!(facts.get("name").contains_back_reference);
        assert!(facts.get("question").contains_back_reference);
        assert!(facts.get("message").contains_back_reference);
        assert!(facts.get("message").needs_encode_context);
        assert!(!facts.get("label_seq").contains_back_reference);
    }

    #[test]
    fn upstream_length_field_needs_decode_context() {
        let facts = analyze_yaml(
            r#"
            types:
              body:
                kind: composite
                sequence:
                  - name: data
                    type: array
                    kind: field_referenced
                    length_field: len_data
                    items: { type: uint, width: 8 }
              envelope:
                kind: composite
                sequence:
                  - { name: len_data, type: uint, width: 16 }
                  - { name: body, type: type_ref, target: body }
            "#,
        );
        let body = facts.get("body");
        assert!(body.needs_decode_context);
        assert_eq!(body.decode_context_fields, vec!["len_data".to_string()]);
        // The parent declares the field locally, so it needs no context.
        assert!(!facts.get("envelope").needs_decode_context);
    }

    #[test]
    fn field_discriminator_needs_decode_context() {
        let facts = analyze_yaml(
            r#"
            types:
              a:
                kind: composite
                sequence: []
              b:
                kind: composite
                sequence: []
              payload:
                kind: union
                discriminator: { kind: field, name: tag }
                variants:
                  - { type_name: a, when: { op: eq, value: 1 } }
                  - { type_name: b, when: { op: eq, value: 2 } }
            "#,
        );
        let payload = facts.get("payload");
        assert!(payload.needs_decode_context);
        assert_eq!(payload.decode_context_fields, vec!["tag".to_string()]);
    }

    #[test]
    fn union_splits_when_a_variant_splits() {
        let facts = analyze_yaml(
            r#"
            types:
              a:
                kind: composite
                sequence:
                  - { name: magic, type: uint, width: 8, const: 1 }
              b:
                kind: composite
                sequence:
                  - { name: value, type: uint, width: 8 }
              either:
                kind: union
                discriminator:
                  kind: peek
                  int: { width: 8 }
                variants:
                  - { type_name: a, when: { op: eq, value: 1 } }
                  - { type_name: b }
            "#,
        );
        assert!(facts.get("a").split_views);
        assert!(!facts.get("b").split_views);
        assert!(facts.get("either").split_views);
    }

    #[test]
    fn selector_targets_mark_tracked_arrays() {
        let facts = analyze_yaml(
            r#"
            types:
              local_file:
                kind: composite
                sequence:
                  - { name: tag, type: uint, width: 8 }
              central_dir_entry:
                kind: composite
                sequence:
                  - name: ofs_local_header
                    type: uint
                    width: 32
                    computed:
                      kind: position_of
                      target: sections[corresponding<local_file>]
              archive:
                kind: composite
                sequence:
                  - name: sections
                    type: array
                    kind: eof_terminated
                    items:
                      type: choice
                      variants: [local_file, central_dir_entry]
            "#,
        );
        let archive = facts.get("archive");
        assert_eq!(
            archive.tracked_arrays.get("sections"),
            Some(&vec!["local_file".to_string()])
        );
        assert!(facts.get("central_dir_entry").needs_encode_context);
        assert!(facts.get("archive").needs_encode_context);
    }

    #[test]
    fn forward_position_of_without_selector_is_unsupported() {
        let schema = Schema::from_yaml(
            r#"
            types:
              record:
                kind: composite
                sequence:
                  - name: ofs_body
                    type: uint
                    width: 32
                    computed: { kind: position_of, target: body }
                  - { name: body, type: uint, width: 8 }
            "#,
        )
        .unwrap();
        assert!(matches!(
            analyze(&schema),
            Err(SchemaError::Unsupported(_))
        ));
    }

    #[test]
    fn ancestor_position_of_without_selector_is_unsupported() {
        let schema = Schema::from_yaml(
            r#"
            types:
              inner:
                kind: composite
                sequence:
                  - name: ofs_header
                    type: uint
                    width: 32
                    computed: { kind: position_of, target: ../header }
              outer:
                kind: composite
                sequence:
                  - { name: header, type: uint, width: 16 }
                  - { name: body, type: type_ref, target: inner }
            "#,
        )
        .unwrap();
        assert!(matches!(
            analyze(&schema),
            Err(SchemaError::Unsupported(_))
        ));
    }

    #[test]
    fn cross_frame_crc32_target_is_unsupported() {
        let yaml_ancestor = r#"
            types:
              trailer:
                kind: composite
                sequence:
                  - name: checksum
                    type: uint
                    width: 32
                    computed: { kind: crc32_of, target: ../header }
              packet:
                kind: composite
                sequence:
                  - { name: header, type: uint, width: 16 }
                  - { name: trailer, type: type_ref, target: trailer }
        "#;
        let schema = Schema::from_yaml(yaml_ancestor).unwrap();
        assert!(matches!(
            analyze(&schema),
            Err(SchemaError::Unsupported(_))
        ));

        // A plain name that is not a sibling resolves through the parent
        // search and is rejected the same way.
        let yaml_non_sibling = r#"
            types:
              trailer:
                kind: composite
                sequence:
                  - name: checksum
                    type: uint
                    width: 32
                    computed: { kind: crc32_of, target: header }
              packet:
                kind: composite
                sequence:
                  - { name: header, type: uint, width: 16 }
                  - { name: trailer, type: type_ref, target: trailer }
        "#;
        let schema = Schema::from_yaml(yaml_non_sibling).unwrap();
        assert!(matches!(
            analyze(&schema),
            Err(SchemaError::Unsupported(_))
        ));
    }

    #[test]
    fn back_reference_in_content_first_range_is_unsupported() {
        let schema = Schema::from_yaml(
            r#"
            types:
              target:
                kind: composite
                sequence:
                  - { name: tag, type: uint, width: 8 }
              record:
                kind: composite
                sequence:
                  - name: len
                    type: uint
                    width: 16
                    computed:
                      kind: length_of
                      target: body
                      from_after_field: len
                  - name: body
                    type: back_reference
                    target: target
                    storage: { width: 16 }
                    mask: 0x3FFF
            "#,
        )
        .unwrap();
        assert!(matches!(
            analyze(&schema),
            Err(SchemaError::Unsupported(_))
        ));
    }
}
