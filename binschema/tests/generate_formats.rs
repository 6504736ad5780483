//! Drives the generator over schemas for real wire formats and checks both
//! the analyzer's classification and the structure of the emitted code.

use binschema::{Generator, Schema};

fn generate(yaml: &str) -> (String, Schema) {
    let schema = Schema::from_yaml(yaml).expect("schema should parse");
    let source = Generator::new(&schema)
        .expect("analysis should succeed")
        .generate()
        .expect("generation should succeed");
    (source, schema)
}

const ZIP_SCHEMA: &str = r#"
config:
  endianness: little
types:
  local_file:
    kind: composite
    sequence:
      - { name: magic, type: uint, width: 32, const: 0x04034b50 }
      - { name: version, type: uint, width: 16, const: 20 }
      - { name: flags, type: uint, width: 16, const: 0 }
      - { name: method, type: uint, width: 16, const: 0 }
      - { name: mtime, type: uint, width: 16 }
      - { name: mdate, type: uint, width: 16 }
      - name: checksum
        type: uint
        width: 32
        computed: { kind: crc32_of, target: body }
      - name: len_body_compressed
        type: uint
        width: 32
        computed: { kind: length_of, target: body }
      - name: len_body_uncompressed
        type: uint
        width: 32
        computed: { kind: length_of, target: body }
      - name: len_file_name
        type: uint
        width: 16
        computed: { kind: length_of, target: file_name }
      - { name: len_extra, type: uint, width: 16, const: 0 }
      - name: file_name
        type: string
        kind: field_referenced
        length_field: len_file_name
      - name: body
        type: array
        kind: field_referenced
        length_field: len_body_compressed
        items: { type: uint, width: 8 }
  central_dir_entry:
    kind: composite
    sequence:
      - { name: magic, type: uint, width: 32, const: 0x02014b50 }
      - name: ofs_local_header
        type: uint
        width: 32
        computed:
          kind: position_of
          target: sections[corresponding<local_file>]
  end_of_central_dir:
    kind: composite
    sequence:
      - { name: magic, type: uint, width: 32, const: 0x06054b50 }
      - name: len_central_dir
        type: uint
        width: 32
        computed:
          kind: sum_of_type_sizes
          array: sections
          type_name: central_dir_entry
      - name: ofs_central_dir
        type: uint
        width: 32
        computed:
          kind: position_of
          target: sections[first<central_dir_entry>]
  archive:
    kind: composite
    sequence:
      - name: sections
        type: array
        kind: eof_terminated
        items:
          type: choice
          variants: [local_file, central_dir_entry, end_of_central_dir]
"#;

#[test]
fn zip_archive_classification() {
    let schema = Schema::from_yaml(ZIP_SCHEMA).unwrap();
    let generator = Generator::new(&schema).unwrap();
    let facts = generator.facts();

    assert!(facts.get("local_file").split_views);
    assert!(!facts.get("local_file").needs_encode_context);
    assert!(!facts.get("local_file").needs_decode_context);

    // Selector targets force a context on the entry types and, by nesting,
    // on the archive.
    assert!(facts.get("central_dir_entry").needs_encode_context);
    assert!(facts.get("end_of_central_dir").needs_encode_context);
    assert!(facts.get("archive").needs_encode_context);

    assert_eq!(
        facts.get("archive").tracked_arrays.get("sections"),
        Some(&vec![
            "local_file".to_string(),
            "central_dir_entry".to_string()
        ])
    );
}

#[test]
fn zip_archive_emission() {
    let (source, _) = generate(ZIP_SCHEMA);

    // Split views with a total Output -> Input conversion.
    assert!(source.contains("pub struct LocalFileInput"));
    assert!(source.contains("pub struct LocalFileOutput"));
    assert!(source.contains("impl From<LocalFileOutput> for LocalFileInput"));

    // Const magics emit as literals at the field's (little) endianness.
    assert!(source.contains("write_u32(0x4034b50u32, ByteOrder::Little)"));

    // Computed fields compile to the specific expression for their case.
    assert!(source.contains("crc32(&self.body)"));
    assert!(source.contains("(self.body.len() as u64)"));
    assert!(source.contains("(self.file_name.len() as u64)"));

    // Corresponding selector: own-type occurrence counter, then position
    // lookup of the correlated local_file.
    assert!(source.contains("ctx.is_current_array(\"sections\")"));
    assert!(source.contains("ctx.type_index(\"sections__central_dir_entry\").saturating_sub(1)"));
    assert!(source.contains("ctx.nth_position(\"sections__local_file\""));

    // First-selector and type-size sum for the end-of-central-directory.
    assert!(source.contains("ctx.first_position(\"sections__central_dir_entry\")"));
    assert!(source.contains(".sum_type_sizes(\"central_dir_entry\")"));

    // The archive runs a position pre-pass and maintains occurrence
    // counters during the real pass.
    assert!(source.contains("ctx.track_position(\"sections__local_file\""));
    assert!(source.contains("ctx.bump_type_index(\"sections__local_file\")"));
    assert!(source.contains("ctx.set_array_iteration(\"sections\""));

    // The inline choice gets its own view-split enums.
    assert!(source.contains("pub enum ArchiveSectionsInput"));
    assert!(source.contains("pub enum ArchiveSectionsOutput"));

    // Const validation rejects recoverably.
    assert!(source.contains("CodecError::ConstMismatch"));
    assert!(source.contains("field: \"local_file.magic\".into()"));
}

const DNS_SCHEMA: &str = r#"
types:
  label:
    kind: composite
    sequence:
      - name: len
        type: uint
        width: 8
        computed: { kind: length_of, target: text }
      - name: text
        type: string
        kind: field_referenced
        length_field: len
        encoding: ascii
  label_seq:
    kind: composite
    sequence:
      - name: labels
        type: array
        kind: null_terminated
        items: { type: type_ref, target: label }
  domain_name:
    kind: alias
    value:
      type: back_reference
      target: label_seq
      storage: { width: 16 }
      mask: 0x3FFF
  question:
    kind: composite
    sequence:
      - { name: qname, type: type_ref, target: domain_name }
      - { name: qtype, type: uint, width: 16 }
      - { name: qclass, type: uint, width: 16 }
  message:
    kind: composite
    sequence:
      - { name: id, type: uint, width: 16 }
      - name: flags
        type: bits
        width: 16
        subfields:
          - { name: qr, width: 1 }
          - { name: opcode, width: 4 }
          - { name: aa, width: 1 }
          - { name: tc, width: 1 }
          - { name: rd, width: 1 }
          - { name: ra, width: 1 }
          - { name: z, width: 3 }
          - { name: rcode, width: 4 }
      - name: qdcount
        type: uint
        width: 16
        computed: { kind: count_of, target: questions }
      - name: questions
        type: array
        kind: computed_count
        length_field: qdcount
        items: { type: type_ref, target: question }
"#;

#[test]
fn dns_message_classification() {
    let schema = Schema::from_yaml(DNS_SCHEMA).unwrap();
    let generator = Generator::new(&schema).unwrap();
    let facts = generator.facts();

    // The back-reference is contagious through the alias and the nesting
    // chain, and drags the encode context with it.
    assert!(facts.get("domain_name").contains_back_reference);
    assert!(facts.get("question").contains_back_reference);
    assert!(facts.get("message").contains_back_reference);
    assert!(facts.get("message").needs_encode_context);
    assert!(!facts.get("label_seq").contains_back_reference);
}

#[test]
fn dns_message_emission() {
    let (source, _) = generate(DNS_SCHEMA);

    // DNS pointer format: 0b11 marker in the two high bits, 14-bit offset.
    assert!(source.contains("0xc000u64 | __pointer_bits"));
    assert!(source.contains("__probe & 0xc000u64 == 0xc000u64"));
    assert!(source.contains("__pointer & 0x3fffu64"));

    // The dictionary is created at the outermost encode boundary and
    // probed per name.
    assert!(source.contains("ctx.ensure_compression_dict();"));
    assert!(source.contains("ctx.compression_dict()"));

    // Back-reference decode chases the offset and restores the cursor;
    // bad offsets surface the dedicated error.
    assert!(source.contains("CodecError::InvalidBackReference"));
    assert!(source.contains("stream.seek(__saved)?;"));

    // Bit-level header flags decompose into named subfields.
    assert!(source.contains("stream.write_bits(u64::from(self.qr), 1)?;"));
    assert!(source.contains("let opcode = stream.read_bits(4)? as u8;"));

    // count_of drives the question count; the array reads it back.
    assert!(source.contains("(self.questions.len() as u64)"));
}

const DER_SCHEMA: &str = r#"
types:
  der_integer:
    kind: composite
    sequence:
      - { name: tag, type: uint, width: 8, const: 0x02 }
      - name: len
        type: varlength
        encoding: der
        computed:
          kind: length_of
          target: value
          from_after_field: len
      - name: value
        type: array
        kind: eof_terminated
        byte_budget: len
        items: { type: uint, width: 8 }
  der_octet_string:
    kind: composite
    sequence:
      - { name: tag, type: uint, width: 8, const: 0x04 }
      - name: len
        type: varlength
        encoding: der
        computed:
          kind: length_of
          target: value
          from_after_field: len
      - name: value
        type: array
        kind: eof_terminated
        byte_budget: len
        items: { type: uint, width: 8 }
  der_sequence:
    kind: composite
    sequence:
      - { name: tag, type: uint, width: 8, const: 0x30 }
      - name: len
        type: varlength
        encoding: der
        computed:
          kind: length_of
          target: items
          from_after_field: len
      - name: items
        type: array
        kind: eof_terminated
        byte_budget: len
        items:
          type: choice
          variants: [der_integer, der_octet_string]
"#;

#[test]
fn der_tlv_emission() {
    let (source, _) = generate(DER_SCHEMA);

    // Content-first: the suspended range encodes into a temporary stream,
    // the DER length writes from the accumulated size, then the buffer is
    // appended.
    assert!(source.contains("let mut __deferred_0_buf = BitStreamEncoder::new"));
    assert!(source.contains("let __deferred_0_bytes = __deferred_0_buf.finish();"));
    assert!(source
        .contains("write_varlength((__deferred_0_bytes.len() as u64), VarlengthEncoding::Der)"));
    assert!(source.contains("write_bytes(&__deferred_0_bytes)?;"));

    // byte_budget decodes the contents through a bounded sub-stream.
    assert!(source.contains("let __budget_items = ((len) as u64) as usize;"));
    assert!(source.contains("BitStreamDecoder::new(&__body_items"));

    // Nested TLVs inside the sequence try-decode variant by variant.
    assert!(source.contains("__e.is_variant_recoverable()"));
    assert!(source.contains("CodecError::NoVariantMatched"));
}

const PNG_SCHEMA: &str = r#"
types:
  png_chunk:
    kind: composite
    sequence:
      - name: len_payload
        type: uint
        width: 32
        computed: { kind: length_of, target: payload }
      - name: chunk_type
        type: string
        kind: fixed
        length: 4
        encoding: ascii
        const: IHDR
      - name: payload
        type: array
        kind: field_referenced
        length_field: len_payload
        items: { type: uint, width: 8 }
      - name: checksum
        type: uint
        width: 32
        computed: { kind: crc32_of, target: chunk_type, through: payload }
"#;

#[test]
fn png_chunk_emission() {
    let (source, schema) = generate(PNG_SCHEMA);
    let generator = Generator::new(&schema).unwrap();

    // Everything resolves in-frame: no contexts, but the views split.
    let facts = generator.facts();
    assert!(facts.get("png_chunk").split_views);
    assert!(!facts.get("png_chunk").needs_encode_context);
    assert!(!facts.get("png_chunk").needs_decode_context);

    // The CRC spans the type tag and the payload, re-encoded to one
    // buffer.
    assert!(source.contains("let __crc_bytes_checksum = {"));
    assert!(source.contains("write_bytes(\"IHDR\".as_bytes())?;"));
    assert!(source.contains("crc32(&__crc_bytes_checksum)"));

    // The decoded type tag validates against the declared literal.
    assert!(source.contains("if chunk_type != \"IHDR\""));

    // Input omits the derived length and checksum.
    let input_struct = source
        .split("pub struct PngChunkInput {")
        .nth(1)
        .and_then(|rest| rest.split('}').next())
        .expect("input struct should be emitted");
    assert!(input_struct.contains("pub payload: Vec<u8>,"));
    assert!(!input_struct.contains("len_payload"));
    assert!(!input_struct.contains("checksum"));
}

const FRAME_SCHEMA: &str = r#"
types:
  ping:
    kind: composite
    sequence:
      - { name: tag, type: uint, width: 8, const: 0x01 }
      - { name: seq, type: uint, width: 16 }
  pointer_frame:
    kind: composite
    sequence:
      - { name: tag, type: uint, width: 8 }
      - { name: offset_low, type: uint, width: 8 }
  raw_frame:
    kind: composite
    sequence:
      - { name: tag, type: uint, width: 8 }
      - name: body
        type: array
        kind: eof_terminated
        items: { type: uint, width: 8 }
  frame:
    kind: union
    discriminator:
      kind: peek
      int: { width: 8 }
    variants:
      - { type_name: ping, when: { op: eq, value: 1 } }
      - { type_name: pointer_frame, when: { op: ge, value: 0xC0 } }
      - { type_name: raw_frame }
"#;

#[test]
fn peek_union_emission() {
    let (source, schema) = generate(FRAME_SCHEMA);
    let generator = Generator::new(&schema).unwrap();

    // One split variant splits the union.
    assert!(generator.facts().get("frame").split_views);
    assert!(source.contains("pub enum FrameInput"));
    assert!(source.contains("pub enum FrameOutput"));

    // Peek never advances; the when-chain runs in declaration order with
    // the clause-less variant as the fallback.
    assert!(source.contains("let __disc = u64::from(stream.peek_u8(ByteOrder::Big)?);"));
    assert!(source.contains("if __disc == 1u64"));
    assert!(source.contains("if __disc >= 192u64"));
    assert!(source.contains("Ok(Self::RawFrame(RawFrame::decode_with_stream(stream)?))"));
}

#[test]
fn upstream_length_field_is_threaded_through_decode_context() {
    let yaml = r#"
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
"#;
    let (source, _) = generate(yaml);

    // The parent builds the child's decode context from its own local.
    assert!(source.contains("let mut __child_ctx = DecodeContext::new();"));
    assert!(source.contains("__child_ctx.insert(\"len_data\", (len_data) as u64);"));
    assert!(source.contains("Body::decode_with_stream_and_context(stream, &__child_ctx)"));

    // The child reads the length from its context.
    assert!(source.contains("ctx.require(\"len_data\")?"));
}
