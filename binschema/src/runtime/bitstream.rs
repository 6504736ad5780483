//! Bit-granular stream types the generated code reads and writes through.
//!
//! [`BitStreamEncoder`] appends bits in MSB-first or LSB-first order and
//! flushes to a byte vector; [`BitStreamDecoder`] reads bits, peeks ahead
//! without advancing, and seeks to arbitrary byte positions for instance
//! fields and back-references.
//!
//! Byte-level operations align implicitly: after any bit-level write, a byte
//! write first pads the partial byte with zero bits; a byte read skips to the
//! next boundary. `finish` zero-pads a trailing partial byte.

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter, LittleEndian};
use serde::Deserialize;
use std::io::{Cursor, SeekFrom};

use super::error::{map_io, CodecError, CodecResult};
use super::varlength::{self, VarlengthEncoding};

/// Order in which bits fill each byte of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitOrder {
    /// First bit written lands in the most significant position.
    #[default]
    MsbFirst,
    /// First bit written lands in the least significant position.
    LsbFirst,
}

/// Byte order for multi-byte integer and float primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Wrapper around the `BitWriter` type that allows it to be used with either
/// bit order.
enum WriterContainer {
    Msb(BitWriter<Cursor<Vec<u8>>, BigEndian>),
    Lsb(BitWriter<Cursor<Vec<u8>>, LittleEndian>),
}

impl WriterContainer {
    fn write(&mut self, bits: u32, value: u64) -> std::io::Result<()> {
        match self {
            WriterContainer::Msb(writer) => writer.write(bits, value),
            WriterContainer::Lsb(writer) => writer.write(bits, value),
        }
    }

    fn write_bytes(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            WriterContainer::Msb(writer) => writer.write_bytes(buf),
            WriterContainer::Lsb(writer) => writer.write_bytes(buf),
        }
    }
}

/// Append-only bit stream backing every generated `encode` routine.
pub struct BitStreamEncoder {
    writer: WriterContainer,
    bits_written: u64,
}

impl BitStreamEncoder {
    pub fn new(bit_order: BitOrder) -> Self {
        let writer = match bit_order {
            BitOrder::MsbFirst => {
                WriterContainer::Msb(BitWriter::endian(Cursor::new(Vec::new()), BigEndian))
            }
            BitOrder::LsbFirst => {
                WriterContainer::Lsb(BitWriter::endian(Cursor::new(Vec::new()), LittleEndian))
            }
        };
        Self {
            writer,
            bits_written: 0,
        }
    }

    /// Appends the low `count` bits of `value`, packing into bytes in the
    /// configured bit order. Fails if `value` does not fit in `count` bits.
    pub fn write_bits(&mut self, value: u64, count: u32) -> CodecResult<()> {
        if count == 0 {
            return Ok(());
        }
        if count > 64 {
            return Err(CodecError::InvalidValue(format!(
                "cannot write {count} bits at once (max 64)"
            )));
        }
        if count < 64 && (value >> count) != 0 {
            return Err(CodecError::InvalidValue(format!(
                "value {value:#x} does not fit in {count} bits"
            )));
        }
        self.writer.write(count, value).map_err(map_io)?;
        self.bits_written += u64::from(count);
        Ok(())
    }

    /// Pads the current byte with zero bits so the next write is byte-aligned.
    pub fn align_to_byte(&mut self) -> CodecResult<()> {
        let rem = (self.bits_written % 8) as u32;
        if rem != 0 {
            self.write_bits(0, 8 - rem)?;
        }
        Ok(())
    }

    /// Appends raw bytes, aligning first.
    pub fn write_bytes(&mut self, buf: &[u8]) -> CodecResult<()> {
        self.align_to_byte()?;
        self.writer.write_bytes(buf).map_err(map_io)?;
        self.bits_written += buf.len() as u64 * 8;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8, _order: ByteOrder) -> CodecResult<()> {
        self.write_bytes(&[value])
    }

    pub fn write_u16(&mut self, value: u16, order: ByteOrder) -> CodecResult<()> {
        match order {
            ByteOrder::Big => self.write_bytes(&value.to_be_bytes()),
            ByteOrder::Little => self.write_bytes(&value.to_le_bytes()),
        }
    }

    pub fn write_u32(&mut self, value: u32, order: ByteOrder) -> CodecResult<()> {
        match order {
            ByteOrder::Big => self.write_bytes(&value.to_be_bytes()),
            ByteOrder::Little => self.write_bytes(&value.to_le_bytes()),
        }
    }

    pub fn write_u64(&mut self, value: u64, order: ByteOrder) -> CodecResult<()> {
        match order {
            ByteOrder::Big => self.write_bytes(&value.to_be_bytes()),
            ByteOrder::Little => self.write_bytes(&value.to_le_bytes()),
        }
    }

    pub fn write_i8(&mut self, value: i8, order: ByteOrder) -> CodecResult<()> {
        self.write_u8(value as u8, order)
    }

    pub fn write_i16(&mut self, value: i16, order: ByteOrder) -> CodecResult<()> {
        self.write_u16(value as u16, order)
    }

    pub fn write_i32(&mut self, value: i32, order: ByteOrder) -> CodecResult<()> {
        self.write_u32(value as u32, order)
    }

    pub fn write_i64(&mut self, value: i64, order: ByteOrder) -> CodecResult<()> {
        self.write_u64(value as u64, order)
    }

    pub fn write_f32(&mut self, value: f32, order: ByteOrder) -> CodecResult<()> {
        self.write_u32(value.to_bits(), order)
    }

    pub fn write_f64(&mut self, value: f64, order: ByteOrder) -> CodecResult<()> {
        self.write_u64(value.to_bits(), order)
    }

    /// Appends `value` in the requested variable-length integer encoding.
    pub fn write_varlength(&mut self, value: u64, encoding: VarlengthEncoding) -> CodecResult<()> {
        let bytes = varlength::encode(value, encoding)?;
        self.write_bytes(&bytes)
    }

    /// Number of fully committed bytes written so far.
    pub fn byte_offset(&self) -> usize {
        (self.bits_written / 8) as usize
    }

    /// Flushes any partial byte (zero-padding) and returns the byte vector.
    pub fn finish(self) -> Vec<u8> {
        // Writes to an in-memory cursor cannot fail.
        let cursor = match self.writer {
            WriterContainer::Msb(mut writer) => {
                writer.byte_align().unwrap();
                writer.flush().unwrap();
                writer.into_writer()
            }
            WriterContainer::Lsb(mut writer) => {
                writer.byte_align().unwrap();
                writer.flush().unwrap();
                writer.into_writer()
            }
        };
        cursor.into_inner()
    }
}

/// Wrapper around the `BitReader` type that allows it to be used with either
/// bit order.
enum ReaderContainer<'a> {
    Msb(BitReader<Cursor<&'a [u8]>, BigEndian>),
    Lsb(BitReader<Cursor<&'a [u8]>, LittleEndian>),
}

impl ReaderContainer<'_> {
    fn read(&mut self, bits: u32) -> std::io::Result<u64> {
        match self {
            ReaderContainer::Msb(reader) => reader.read(bits),
            ReaderContainer::Lsb(reader) => reader.read(bits),
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            ReaderContainer::Msb(reader) => reader.read_bytes(buf),
            ReaderContainer::Lsb(reader) => reader.read_bytes(buf),
        }
    }

    fn seek_bits(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        match self {
            ReaderContainer::Msb(reader) => reader.seek_bits(from),
            ReaderContainer::Lsb(reader) => reader.seek_bits(from),
        }
    }

    fn position_in_bits(&mut self) -> std::io::Result<u64> {
        match self {
            ReaderContainer::Msb(reader) => reader.position_in_bits(),
            ReaderContainer::Lsb(reader) => reader.position_in_bits(),
        }
    }
}

/// Read-only bit stream backing every generated `decode` routine.
///
/// Instance-field and back-reference decoding mutate the cursor but always
/// restore it before returning; that invariant is the correctness criterion
/// for both features.
pub struct BitStreamDecoder<'a> {
    reader: ReaderContainer<'a>,
    len: usize,
}

impl<'a> BitStreamDecoder<'a> {
    pub fn new(data: &'a [u8], bit_order: BitOrder) -> Self {
        let reader = match bit_order {
            BitOrder::MsbFirst => {
                ReaderContainer::Msb(BitReader::endian(Cursor::new(data), BigEndian))
            }
            BitOrder::LsbFirst => {
                ReaderContainer::Lsb(BitReader::endian(Cursor::new(data), LittleEndian))
            }
        };
        Self {
            reader,
            len: data.len(),
        }
    }

    /// Reads `count` bits and returns them right-aligned.
    pub fn read_bits(&mut self, count: u32) -> CodecResult<u64> {
        if count == 0 {
            return Ok(0);
        }
        if count > 64 {
            return Err(CodecError::InvalidValue(format!(
                "cannot read {count} bits at once (max 64)"
            )));
        }
        self.reader.read(count).map_err(map_io)
    }

    /// Skips to the next byte boundary.
    pub fn align_to_byte(&mut self) -> CodecResult<()> {
        let pos = self.reader.position_in_bits().map_err(map_io)?;
        let rem = pos % 8;
        if rem != 0 {
            self.reader
                .seek_bits(SeekFrom::Start(pos + (8 - rem)))
                .map_err(map_io)?;
        }
        Ok(())
    }

    /// Reads `count` raw bytes, aligning first.
    pub fn read_byte_vec(&mut self, count: usize) -> CodecResult<Vec<u8>> {
        self.align_to_byte()?;
        let mut buf = vec![0u8; count];
        self.reader.read_bytes(&mut buf).map_err(map_io)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self, _order: ByteOrder) -> CodecResult<u8> {
        self.align_to_byte()?;
        let mut buf = [0u8; 1];
        self.reader.read_bytes(&mut buf).map_err(map_io)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self, order: ByteOrder) -> CodecResult<u16> {
        self.align_to_byte()?;
        let mut buf = [0u8; 2];
        self.reader.read_bytes(&mut buf).map_err(map_io)?;
        Ok(match order {
            ByteOrder::Big => u16::from_be_bytes(buf),
            ByteOrder::Little => u16::from_le_bytes(buf),
        })
    }

    pub fn read_u32(&mut self, order: ByteOrder) -> CodecResult<u32> {
        self.align_to_byte()?;
        let mut buf = [0u8; 4];
        self.reader.read_bytes(&mut buf).map_err(map_io)?;
        Ok(match order {
            ByteOrder::Big => u32::from_be_bytes(buf),
            ByteOrder::Little => u32::from_le_bytes(buf),
        })
    }

    pub fn read_u64(&mut self, order: ByteOrder) -> CodecResult<u64> {
        self.align_to_byte()?;
        let mut buf = [0u8; 8];
        self.reader.read_bytes(&mut buf).map_err(map_io)?;
        Ok(match order {
            ByteOrder::Big => u64::from_be_bytes(buf),
            ByteOrder::Little => u64::from_le_bytes(buf),
        })
    }

    pub fn read_i8(&mut self, order: ByteOrder) -> CodecResult<i8> {
        Ok(self.read_u8(order)? as i8)
    }

    pub fn read_i16(&mut self, order: ByteOrder) -> CodecResult<i16> {
        Ok(self.read_u16(order)? as i16)
    }

    pub fn read_i32(&mut self, order: ByteOrder) -> CodecResult<i32> {
        Ok(self.read_u32(order)? as i32)
    }

    pub fn read_i64(&mut self, order: ByteOrder) -> CodecResult<i64> {
        Ok(self.read_u64(order)? as i64)
    }

    pub fn read_f32(&mut self, order: ByteOrder) -> CodecResult<f32> {
        Ok(f32::from_bits(self.read_u32(order)?))
    }

    pub fn read_f64(&mut self, order: ByteOrder) -> CodecResult<f64> {
        Ok(f64::from_bits(self.read_u64(order)?))
    }

    /// Reads an integer in the requested variable-length encoding.
    pub fn read_varlength(&mut self, encoding: VarlengthEncoding) -> CodecResult<u64> {
        varlength::decode(self, encoding)
    }

    pub fn peek_u8(&mut self, order: ByteOrder) -> CodecResult<u8> {
        let saved = self.reader.position_in_bits().map_err(map_io)?;
        let result = self.read_u8(order);
        self.reader
            .seek_bits(SeekFrom::Start(saved))
            .map_err(map_io)?;
        result
    }

    pub fn peek_u16(&mut self, order: ByteOrder) -> CodecResult<u16> {
        let saved = self.reader.position_in_bits().map_err(map_io)?;
        let result = self.read_u16(order);
        self.reader
            .seek_bits(SeekFrom::Start(saved))
            .map_err(map_io)?;
        result
    }

    pub fn peek_u32(&mut self, order: ByteOrder) -> CodecResult<u32> {
        let saved = self.reader.position_in_bits().map_err(map_io)?;
        let result = self.read_u32(order);
        self.reader
            .seek_bits(SeekFrom::Start(saved))
            .map_err(map_io)?;
        result
    }

    pub fn peek_u64(&mut self, order: ByteOrder) -> CodecResult<u64> {
        let saved = self.reader.position_in_bits().map_err(map_io)?;
        let result = self.read_u64(order);
        self.reader
            .seek_bits(SeekFrom::Start(saved))
            .map_err(map_io)?;
        result
    }

    /// Peeks `count` raw bytes without advancing. Returns `None` when fewer
    /// than `count` bytes remain.
    pub fn peek_byte_vec(&mut self, count: usize) -> CodecResult<Option<Vec<u8>>> {
        let saved = self.reader.position_in_bits().map_err(map_io)?;
        let result = match self.read_byte_vec(count) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(CodecError::EndOfStream) => Ok(None),
            Err(other) => Err(other),
        };
        self.reader
            .seek_bits(SeekFrom::Start(saved))
            .map_err(map_io)?;
        result
    }

    /// Moves the cursor to an absolute byte position.
    pub fn seek(&mut self, byte_position: usize) -> CodecResult<()> {
        self.reader
            .seek_bits(SeekFrom::Start(byte_position as u64 * 8))
            .map_err(map_io)?;
        Ok(())
    }

    /// Current byte position (bit-level progress rounds down).
    pub fn position(&mut self) -> CodecResult<usize> {
        Ok((self.reader.position_in_bits().map_err(map_io)? / 8) as usize)
    }

    /// Total length of the underlying buffer in bytes.
    pub fn bytes_len(&self) -> usize {
        self.len
    }

    /// Bytes between the current position and the end of the buffer.
    pub fn remaining_bytes(&mut self) -> CodecResult<usize> {
        Ok(self.len.saturating_sub(self.position()?))
    }
}
