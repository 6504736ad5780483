//! CRC-32 (ISO 3309 / PKZIP) used by generated `crc32_of` fields.

/// One-shot CRC-32 over `bytes`: reflected polynomial `0xEDB88320`, initial
/// value `0xFFFF_FFFF`, final xor `0xFFFF_FFFF`.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // The classic check value for the PKZIP polynomial.
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn crc32_of_stored_zip_body() {
        assert_eq!(crc32(b"Hello, World!"), 0xEBE6C6E6);
    }

    #[test]
    fn crc32_of_empty_input() {
        assert_eq!(crc32(b""), 0);
    }
}
