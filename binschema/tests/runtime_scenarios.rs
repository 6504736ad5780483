//! Byte-level fixed points the target formats mandate, exercised directly
//! against the runtime the generated code links with.

use binschema::runtime::{
    crc32, BitOrder, BitStreamDecoder, BitStreamEncoder, ByteOrder, CodecError, VarlengthEncoding,
};

#[test]
fn zip_stored_body_crc() {
    // The checksum a stored "Hello, World!" entry carries.
    assert_eq!(crc32(b"Hello, World!"), 0xEBE6C6E6);
    assert_eq!(b"Hello, World!".len(), 13);
}

#[test]
fn zip_signatures_little_endian() {
    let mut enc = BitStreamEncoder::new(BitOrder::MsbFirst);
    enc.write_u32(0x04034b50, ByteOrder::Little).unwrap();
    enc.write_u16(20, ByteOrder::Little).unwrap();
    enc.write_u16(0, ByteOrder::Little).unwrap();
    enc.write_u16(0, ByteOrder::Little).unwrap();
    let bytes = enc.finish();
    assert_eq!(
        bytes,
        [0x50, 0x4b, 0x03, 0x04, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    let mut enc = BitStreamEncoder::new(BitOrder::MsbFirst);
    enc.write_u32(0x06054b50, ByteOrder::Little).unwrap();
    assert_eq!(enc.finish(), [0x50, 0x4b, 0x05, 0x06]);
}

#[test]
fn der_nested_tlv_bytes() {
    // SEQUENCE { INTEGER 42, OCTET STRING "ok" } assembled the way the
    // generated content-first encoder does: contents to a temporary
    // stream, DER length from its size, then the buffer.
    let mut contents = BitStreamEncoder::new(BitOrder::MsbFirst);

    let mut integer = BitStreamEncoder::new(BitOrder::MsbFirst);
    integer.write_bytes(&[42]).unwrap();
    let integer_bytes = integer.finish();
    contents.write_u8(0x02, ByteOrder::Big).unwrap();
    contents
        .write_varlength(integer_bytes.len() as u64, VarlengthEncoding::Der)
        .unwrap();
    contents.write_bytes(&integer_bytes).unwrap();

    let mut octets = BitStreamEncoder::new(BitOrder::MsbFirst);
    octets.write_bytes(b"ok").unwrap();
    let octet_bytes = octets.finish();
    contents.write_u8(0x04, ByteOrder::Big).unwrap();
    contents
        .write_varlength(octet_bytes.len() as u64, VarlengthEncoding::Der)
        .unwrap();
    contents.write_bytes(&octet_bytes).unwrap();

    let contents_bytes = contents.finish();

    let mut message = BitStreamEncoder::new(BitOrder::MsbFirst);
    message.write_u8(0x30, ByteOrder::Big).unwrap();
    message
        .write_varlength(contents_bytes.len() as u64, VarlengthEncoding::Der)
        .unwrap();
    message.write_bytes(&contents_bytes).unwrap();

    assert_eq!(
        message.finish(),
        [0x30, 0x07, 0x02, 0x01, 0x2a, 0x04, 0x02, 0x6f, 0x6b]
    );
}

#[test]
fn der_budget_substream_decodes_nested_tlvs() {
    let bytes = [0x30, 0x07, 0x02, 0x01, 0x2a, 0x04, 0x02, 0x6f, 0x6b];
    let mut stream = BitStreamDecoder::new(&bytes, BitOrder::MsbFirst);

    assert_eq!(stream.read_u8(ByteOrder::Big).unwrap(), 0x30);
    let budget = stream.read_varlength(VarlengthEncoding::Der).unwrap() as usize;
    assert_eq!(budget, 7);

    let body = stream.read_byte_vec(budget).unwrap();
    let mut sub = BitStreamDecoder::new(&body, BitOrder::MsbFirst);

    assert_eq!(sub.read_u8(ByteOrder::Big).unwrap(), 0x02);
    let len = sub.read_varlength(VarlengthEncoding::Der).unwrap() as usize;
    assert_eq!(sub.read_byte_vec(len).unwrap(), [42]);

    assert_eq!(sub.read_u8(ByteOrder::Big).unwrap(), 0x04);
    let len = sub.read_varlength(VarlengthEncoding::Der).unwrap() as usize;
    assert_eq!(sub.read_byte_vec(len).unwrap(), b"ok");

    assert_eq!(sub.remaining_bytes().unwrap(), 0);
    assert_eq!(stream.remaining_bytes().unwrap(), 0);
}

#[test]
fn dns_pointer_format() {
    // A pointer to offset 12 wears the 0b11 marker in the two high bits.
    let offset = 12u64;
    let mut enc = BitStreamEncoder::new(BitOrder::MsbFirst);
    enc.write_u16((0xC000 | offset) as u16, ByteOrder::Big).unwrap();
    assert_eq!(enc.finish(), [0xC0, 0x0C]);

    let bytes = [0xC0, 0x0C];
    let mut dec = BitStreamDecoder::new(&bytes, BitOrder::MsbFirst);
    let probe = u64::from(dec.peek_u16(ByteOrder::Big).unwrap());
    assert_eq!(probe & 0xC000, 0xC000);
    let pointer = u64::from(dec.read_u16(ByteOrder::Big).unwrap());
    assert_eq!(pointer & 0x3FFF, 12);
}

#[test]
fn back_reference_chase_restores_position() {
    // Label data at offset 0, a pointer to it later in the message. The
    // decode order mirrors the generated code: peek, read pointer, seek,
    // decode, restore.
    let message = [
        0x03, b'f', b'o', b'o', // length-3 label at offset 0
        0xAA, 0xBB, // unrelated bytes
        0xC0, 0x00, // pointer to offset 0
        0x55, // trailing byte read after the chase
    ];
    let mut dec = BitStreamDecoder::new(&message, BitOrder::MsbFirst);
    dec.seek(6).unwrap();

    let probe = u64::from(dec.peek_u16(ByteOrder::Big).unwrap());
    assert_eq!(probe & 0xC000, 0xC000);
    let here = dec.position().unwrap();
    let pointer = u64::from(dec.read_u16(ByteOrder::Big).unwrap());
    let target = (pointer & 0x3FFF) as usize;
    assert!(target < here);

    let saved = dec.position().unwrap();
    dec.seek(target).unwrap();
    let len = dec.read_u8(ByteOrder::Big).unwrap() as usize;
    let label = dec.read_byte_vec(len).unwrap();
    assert_eq!(label, b"foo");
    dec.seek(saved).unwrap();

    assert_eq!(dec.read_u8(ByteOrder::Big).unwrap(), 0x55);
}

#[test]
fn png_chunk_crc_covers_type_and_payload() {
    // IHDR for a 1x1 grayscale image.
    let payload: [u8; 13] = [0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0];
    let mut region = Vec::new();
    region.extend_from_slice(b"IHDR");
    region.extend_from_slice(&payload);
    let checksum = crc32(&region);

    // Corrupting a payload byte must break the recomputation.
    let mut corrupted = region.clone();
    corrupted[7] ^= 0xFF;
    assert_ne!(crc32(&corrupted), checksum);

    // The chunk framing the generated encoder produces.
    let mut enc = BitStreamEncoder::new(BitOrder::MsbFirst);
    enc.write_u32(payload.len() as u32, ByteOrder::Big).unwrap();
    enc.write_bytes(&region).unwrap();
    enc.write_u32(checksum, ByteOrder::Big).unwrap();
    let chunk = enc.finish();
    assert_eq!(chunk.len(), 4 + 4 + 13 + 4);
    assert_eq!(&chunk[0..4], [0, 0, 0, 13]);
    assert_eq!(&chunk[4..8], b"IHDR");
}

#[test]
fn variant_rejection_rewinds_for_the_next_attempt() {
    // A failed const probe surfaces a recoverable error; the caller seeks
    // back and tries the next variant, exactly as the generated try-each
    // loop does.
    let bytes = [0x04, 0x02, 0x6f, 0x6b];
    let mut dec = BitStreamDecoder::new(&bytes, BitOrder::MsbFirst);

    let start = dec.position().unwrap();
    let tag = dec.read_u8(ByteOrder::Big).unwrap();
    let attempt: Result<(), CodecError> = if tag != 0x02 {
        Err(CodecError::ConstMismatch {
            field: "der_integer.tag".into(),
            expected: "0x2".into(),
            actual: format!("{tag:#x}"),
        })
    } else {
        Ok(())
    };
    let err = attempt.unwrap_err();
    assert!(err.is_variant_recoverable());

    dec.seek(start).unwrap();
    assert_eq!(dec.read_u8(ByteOrder::Big).unwrap(), 0x04);
}
