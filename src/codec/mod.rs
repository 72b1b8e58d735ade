//! # Codec Primitives
//!
//! Byte cursors and checksums shared by every wire format in the crate.

pub mod crc;
pub mod cursor;

pub use cursor::{ByteReader, ByteWriter, Endian};
