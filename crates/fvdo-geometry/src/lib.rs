#![forbid(unsafe_code)]
//! On-disk codecs for FrankenVDO: the volume geometry block, the
//! block-map component state record, and a buffered sequential block
//! writer for laying records down.
//!
//! All formats are little-endian packed with explicit field reads; no
//! struct is ever reinterpreted from raw bytes.

mod blockmap;
mod geometry;
mod writer;

pub use blockmap::{BlockMapState, BLOCK_MAP_FLAT_PAGE_ORIGIN};
pub use geometry::{
    IndexConfig, RegionId, VolumeGeometry, VolumeRegion, GEOMETRY_BLOCK_LOCATION, GEOMETRY_MAGIC,
};
pub use writer::{BufferedBlockWriter, RegionWriter};

use thiserror::Error;

/// Codec failure: either malformed bytes on decode or an I/O failure
/// underneath the writer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },

    #[error("invalid magic")]
    InvalidMagic,

    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("encoded size {actual} disagrees with header size {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("write failed: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

// ---------------------------------------------------------------------------
// Little-endian field cursors
// ---------------------------------------------------------------------------

/// Sequential little-endian reader over a byte slice.
#[derive(Debug)]
pub(crate) struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end =
            self.offset
                .checked_add(len)
                .ok_or(CodecError::InsufficientData {
                    needed: len,
                    offset: self.offset,
                    actual: 0,
                })?;
        if end > self.bytes.len() {
            return Err(CodecError::InsufficientData {
                needed: len,
                offset: self.offset,
                actual: self.bytes.len().saturating_sub(self.offset),
            });
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        Ok(bytes.try_into().expect("fixed-size slice"))
    }
}

/// Sequential little-endian writer into an owned buffer.
#[derive(Debug, Default)]
pub(crate) struct FieldWriter {
    bytes: Vec<u8>,
}

impl FieldWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_bytes(&mut self, value: &[u8]) {
        self.bytes.extend_from_slice(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_underrun() {
        let mut reader = FieldReader::new(&[1, 2, 3]);
        assert_eq!(reader.read_u8().unwrap(), 1);
        let err = reader.read_u32().unwrap_err();
        assert!(matches!(
            err,
            CodecError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 2,
            }
        ));
    }

    #[test]
    fn writer_reader_roundtrip() {
        let mut writer = FieldWriter::new();
        writer.put_u32(0xDEAD_BEEF);
        writer.put_u64(42);
        writer.put_u8(7);
        let bytes = writer.into_bytes();

        let mut reader = FieldReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.offset(), bytes.len());
    }
}
