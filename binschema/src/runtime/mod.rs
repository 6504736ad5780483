//! Runtime support the generated code links against.
//!
//! Nothing in here interprets schemas: the generator emits monomorphic code
//! per type, and these modules provide the primitive bit/byte operations,
//! variable-length codecs, CRC-32, context objects, and the closed error
//! taxonomy that code calls into.

pub mod bitstream;
pub mod checksum;
pub mod context;
pub mod error;
pub mod varlength;

pub use bitstream::{BitOrder, BitStreamDecoder, BitStreamEncoder, ByteOrder};
pub use checksum::crc32;
pub use context::{CompressionDict, DecodeContext, EncodeContext, FieldMap, FieldValue, ItemEntry};
pub use error::{CodecError, CodecResult};
pub use varlength::VarlengthEncoding;
