//! # Binary Cursor
//!
//! Bounds-checked readers and writers with a per-instance byte order.
//!
//! MSP and MAVLink payloads are little-endian while the outer datagram
//! format is big-endian, so every cursor carries its own [`Endian`].
//! Reads never panic: running past the end yields
//! [`AirLinkError::BufferUnderrun`] and leaves the position untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{AirLinkError, Result};

/// Byte order used by a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

macro_rules! read_num {
    ($name:ident, $ty:ty, $be:ident, $le:ident) => {
        #[doc = concat!("Read a `", stringify!($ty), "` in the cursor's byte order")]
        pub fn $name(&mut self) -> Result<$ty> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(match self.endian {
                Endian::Big => self.buf.$be(),
                Endian::Little => self.buf.$le(),
            })
        }
    };
}

macro_rules! write_num {
    ($name:ident, $ty:ty, $be:ident, $le:ident) => {
        #[doc = concat!("Append a `", stringify!($ty), "` in the writer's byte order")]
        pub fn $name(&mut self, value: $ty) -> &mut Self {
            match self.endian {
                Endian::Big => self.buf.$be(value),
                Endian::Little => self.buf.$le(value),
            }
            self
        }
    };
}

/// Read cursor over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    size: usize,
    endian: Endian,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            buf: data,
            size: data.len(),
            endian,
        }
    }

    pub fn big_endian(data: &'a [u8]) -> Self {
        Self::new(data, Endian::Big)
    }

    pub fn little_endian(data: &'a [u8]) -> Self {
        Self::new(data, Endian::Little)
    }

    /// Total number of bytes the cursor was created over
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.size - self.remaining()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(AirLinkError::BufferUnderrun { needed, remaining });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    /// Any non-zero byte is `true`
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    read_num!(read_u16, u16, get_u16, get_u16_le);
    read_num!(read_i16, i16, get_i16, get_i16_le);
    read_num!(read_u32, u32, get_u32, get_u32_le);
    read_num!(read_i32, i32, get_i32, get_i32_le);
    read_num!(read_u64, u64, get_u64, get_u64_le);
    read_num!(read_i64, i64, get_i64, get_i64_le);
    read_num!(read_f32, f32, get_f32, get_f32_le);

    /// Read a 24-bit unsigned integer (MAVLink v2 message id)
    pub fn read_u24(&mut self) -> Result<u32> {
        self.ensure(3)?;
        let value = match self.endian {
            Endian::Big => self.buf.get_uint(3),
            Endian::Little => self.buf.get_uint_le(3),
        };
        Ok(value as u32)
    }

    /// Borrow the next `len` bytes and advance past them
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Borrow everything that is left without advancing
    pub fn peek_remaining(&self) -> &'a [u8] {
        self.buf
    }

    /// Borrow everything that is left
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.ensure(len)?;
        self.buf.advance(len);
        Ok(())
    }

    /// Read an `i16` length-prefixed UTF-8 string; a non-positive length is empty
    pub fn read_utf(&mut self) -> Result<String> {
        let len = self.read_i16()?;
        if len <= 0 {
            return Ok(String::new());
        }
        let bytes = self.read_bytes(len as usize)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Growable write cursor
///
/// Writes never truncate; the backing buffer grows as needed.
#[derive(Debug, Clone)]
pub struct ByteWriter {
    buf: BytesMut,
    endian: Endian,
}

impl ByteWriter {
    pub fn new(endian: Endian) -> Self {
        Self::with_capacity(endian, 64)
    }

    pub fn with_capacity(endian: Endian, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            endian,
        }
    }

    pub fn big_endian() -> Self {
        Self::new(Endian::Big)
    }

    pub fn little_endian() -> Self {
        Self::new(Endian::Little)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.buf.put_i8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    write_num!(write_u16, u16, put_u16, put_u16_le);
    write_num!(write_i16, i16, put_i16, put_i16_le);
    write_num!(write_u32, u32, put_u32, put_u32_le);
    write_num!(write_i32, i32, put_i32, put_i32_le);
    write_num!(write_u64, u64, put_u64, put_u64_le);
    write_num!(write_i64, i64, put_i64, put_i64_le);
    write_num!(write_f32, f32, put_f32, put_f32_le);

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Write an `i16` length prefix followed by the UTF-8 bytes
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the string does not fit an `i16` length.
    pub fn write_utf(&mut self, value: &str) -> Result<&mut Self> {
        let len = i16::try_from(value.len())
            .map_err(|_| AirLinkError::Protocol(format!("string too long: {} bytes", value.len())))?;
        self.write_i16(len);
        self.buf.put_slice(value.as_bytes());
        Ok(self)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_respect_endianness() {
        let data = [0x01, 0x02, 0x03, 0x04];

        let mut be = ByteReader::big_endian(&data);
        assert_eq!(be.read_u16().unwrap(), 0x0102);
        assert_eq!(be.read_u16().unwrap(), 0x0304);

        let mut le = ByteReader::little_endian(&data);
        assert_eq!(le.read_u32().unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_underrun_leaves_position() {
        let data = [0xAA, 0xBB, 0xCC];
        let mut reader = ByteReader::little_endian(&data);
        reader.read_u8().unwrap();

        let err = reader.read_u32().unwrap_err();
        assert!(matches!(
            err,
            AirLinkError::BufferUnderrun { needed: 4, remaining: 2 }
        ));
        assert_eq!(reader.position(), 1);
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.size(), 3);
    }

    #[test]
    fn test_read_u24_little_endian() {
        let data = [0x94, 0x00, 0x01];
        let mut reader = ByteReader::little_endian(&data);
        assert_eq!(reader.read_u24().unwrap(), 0x01_0094);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_read_bytes_and_skip() {
        let data = [1, 2, 3, 4, 5];
        let mut reader = ByteReader::big_endian(&data);
        reader.skip(1).unwrap();
        assert_eq!(reader.read_bytes(2).unwrap(), &[2, 3]);
        assert!(reader.skip(3).is_err());
        assert_eq!(reader.read_remaining(), &[4, 5]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_writer_mixed_endianness() {
        let mut be = ByteWriter::big_endian();
        be.write_i16(-2).write_u32(0x0102_0304);
        assert_eq!(be.as_slice(), &[0xFF, 0xFE, 0x01, 0x02, 0x03, 0x04]);

        let mut le = ByteWriter::little_endian();
        le.write_u16(0x1234);
        assert_eq!(le.into_vec(), vec![0x34, 0x12]);
    }

    #[test]
    fn test_utf_roundtrip_and_empty() {
        let mut writer = ByteWriter::big_endian();
        writer.write_utf("DD").unwrap();
        writer.write_i16(0);
        let data = writer.into_vec();
        assert_eq!(&data[..4], &[0x00, 0x02, b'D', b'D']);

        let mut reader = ByteReader::big_endian(&data);
        assert_eq!(reader.read_utf().unwrap(), "DD");
        assert_eq!(reader.read_utf().unwrap(), "");
    }

    #[test]
    fn test_writer_grows_past_capacity() {
        let mut writer = ByteWriter::with_capacity(Endian::Big, 2);
        writer.write_bytes(&[0u8; 100]);
        assert_eq!(writer.len(), 100);
    }
}
