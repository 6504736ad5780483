//! Runtime error taxonomy shared by generated code and the stream types.
//!
//! Every failure the emitted encode/decode routines can hit is a variant of
//! [`CodecError`]. Compiler-side failures (malformed schemas, undefined type
//! references) live in [`crate::schema::SchemaError`] and never cross into
//! this enum.

use std::io;

use thiserror::Error;

pub type CodecResult<T, E = CodecError> = std::result::Result<T, E>;

/// Errors raised while encoding or decoding a message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("attempted to read past the end of the stream")]
    EndOfStream,

    #[error("decoded string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("const field '{field}' decoded {actual}, schema declares {expected}")]
    ConstMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("variant '{0}' rejected during union decode")]
    VariantRejection(String),

    #[error("no variant of union '{0}' matched the input")]
    NoVariantMatched(String),

    #[error("decode context is missing parent field '{0}'")]
    MissingContext(String),

    #[error("back-reference offset {offset} does not point before byte position {position}")]
    InvalidBackReference { offset: usize, position: usize },

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl CodecError {
    /// Whether a union's try-each-variant loop may swallow this error, rewind
    /// the stream, and attempt the next variant.
    pub fn is_variant_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::ConstMismatch { .. }
                | CodecError::VariantRejection(_)
                | CodecError::InvalidValue(_)
                | CodecError::EndOfStream
        )
    }
}

/// Maps I/O failures surfaced by the bit stream layer into the closed
/// taxonomy. The backing buffers are in-memory, so the only error the layer
/// genuinely produces is an unexpected EOF.
pub(crate) fn map_io(err: io::Error) -> CodecError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::EndOfStream
    } else {
        CodecError::InvalidValue(format!("bit stream I/O error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_cover_the_union_retry_set() {
        assert!(CodecError::EndOfStream.is_variant_recoverable());
        assert!(CodecError::ConstMismatch {
            field: "magic".into(),
            expected: "0x1234".into(),
            actual: "0x0".into(),
        }
        .is_variant_recoverable());
        assert!(CodecError::VariantRejection("A".into()).is_variant_recoverable());
        assert!(CodecError::InvalidValue("bad varint".into()).is_variant_recoverable());

        assert!(!CodecError::MissingContext("len".into()).is_variant_recoverable());
        assert!(!CodecError::NoVariantMatched("Message".into()).is_variant_recoverable());
        assert!(!CodecError::InvalidBackReference {
            offset: 9,
            position: 4
        }
        .is_variant_recoverable());
    }

    #[test]
    fn eof_maps_to_end_of_stream() {
        let err = map_io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(err, CodecError::EndOfStream));

        let err = map_io(io::Error::new(io::ErrorKind::Other, "weird"));
        assert!(matches!(err, CodecError::InvalidValue(_)));
    }
}
