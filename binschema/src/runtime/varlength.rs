//! Variable-length integer codecs: ASN.1/DER lengths, LEB128, and VLQ.

use serde::Deserialize;

use super::bitstream::BitStreamDecoder;
use super::error::{CodecError, CodecResult};

/// The variable-length integer encodings the schema language recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarlengthEncoding {
    /// ASN.1/DER definite length: 0-127 in one byte with the high bit clear;
    /// larger values as a length-of-length byte (high bit set) followed by
    /// that many big-endian bytes.
    Der,
    /// 7 data bits per byte with a continuation bit, little-endian groups.
    Leb128,
    /// 7 data bits per byte with a continuation bit, big-endian groups.
    Vlq,
}

/// Encodes `value` to its byte representation.
pub fn encode(value: u64, encoding: VarlengthEncoding) -> CodecResult<Vec<u8>> {
    Ok(match encoding {
        VarlengthEncoding::Der => {
            if value < 0x80 {
                vec![value as u8]
            } else {
                let mut payload = value.to_be_bytes().to_vec();
                while payload.len() > 1 && payload[0] == 0 {
                    payload.remove(0);
                }
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.push(0x80 | payload.len() as u8);
                out.extend_from_slice(&payload);
                out
            }
        }
        VarlengthEncoding::Leb128 => {
            let mut out = Vec::new();
            let mut rest = value;
            loop {
                let mut byte = (rest & 0x7F) as u8;
                rest >>= 7;
                if rest != 0 {
                    byte |= 0x80;
                }
                out.push(byte);
                if rest == 0 {
                    break;
                }
            }
            out
        }
        VarlengthEncoding::Vlq => {
            let mut groups = vec![(value & 0x7F) as u8];
            let mut rest = value >> 7;
            while rest != 0 {
                groups.push((rest & 0x7F) as u8);
                rest >>= 7;
            }
            groups.reverse();
            let last = groups.len() - 1;
            for group in &mut groups[..last] {
                *group |= 0x80;
            }
            groups
        }
    })
}

/// Decodes one integer from the stream's current position.
pub fn decode(stream: &mut BitStreamDecoder<'_>, encoding: VarlengthEncoding) -> CodecResult<u64> {
    match encoding {
        VarlengthEncoding::Der => {
            let first = stream.read_bits(8)? as u8;
            if first < 0x80 {
                return Ok(u64::from(first));
            }
            let count = (first & 0x7F) as usize;
            if count == 0 {
                return Err(CodecError::InvalidValue(
                    "DER indefinite length is not supported".into(),
                ));
            }
            if count > 8 {
                return Err(CodecError::InvalidValue(format!(
                    "DER length-of-length {count} exceeds 8 bytes"
                )));
            }
            let mut value = 0u64;
            for _ in 0..count {
                value = (value << 8) | stream.read_bits(8)?;
            }
            Ok(value)
        }
        VarlengthEncoding::Leb128 => {
            let mut value = 0u64;
            let mut shift = 0u32;
            loop {
                let byte = stream.read_bits(8)? as u8;
                if shift >= 64 || (shift == 63 && (byte & 0x7F) > 1) {
                    return Err(CodecError::InvalidValue(
                        "LEB128 value overflows 64 bits".into(),
                    ));
                }
                value |= u64::from(byte & 0x7F) << shift;
                if byte & 0x80 == 0 {
                    return Ok(value);
                }
                shift += 7;
            }
        }
        VarlengthEncoding::Vlq => {
            let mut value = 0u64;
            loop {
                let byte = stream.read_bits(8)? as u8;
                if value > (u64::MAX >> 7) {
                    return Err(CodecError::InvalidValue(
                        "VLQ value overflows 64 bits".into(),
                    ));
                }
                value = (value << 7) | u64::from(byte & 0x7F);
                if byte & 0x80 == 0 {
                    return Ok(value);
                }
            }
        }
    }
}
