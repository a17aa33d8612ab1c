//! Block-map component state record.
//!
//! The block map persists a small versioned component record alongside
//! the device metadata. The flat-page fields are historical: current
//! volumes always record the canonical origin and a zero count, and the
//! decoder enforces both so that a volume written by an older layout is
//! refused rather than misread.

use crate::{CodecError, FieldReader, FieldWriter, Result};

/// Canonical origin recorded in the (empty) flat-page prefix.
pub const BLOCK_MAP_FLAT_PAGE_ORIGIN: u64 = 1;

const BLOCK_MAP_COMPONENT_ID: u32 = 2;
const BLOCK_MAP_MAJOR_VERSION: u32 = 2;
const BLOCK_MAP_MINOR_VERSION: u32 = 0;
/// Payload bytes following the header: four u64 fields.
const BLOCK_MAP_STATE_SIZE: usize = 32;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8;

/// Persisted block-map component state, version 2.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapState {
    pub flat_page_origin: u64,
    pub flat_page_count: u64,
    pub root_origin: u64,
    pub root_count: u64,
}

impl BlockMapState {
    /// Build the canonical state for a fresh volume.
    #[must_use]
    pub fn new(root_origin: u64, root_count: u64) -> Self {
        Self {
            flat_page_origin: BLOCK_MAP_FLAT_PAGE_ORIGIN,
            flat_page_count: 0,
            root_origin,
            root_count,
        }
    }

    /// Total encoded size, header included.
    #[must_use]
    pub fn encoded_size() -> usize {
        HEADER_SIZE + BLOCK_MAP_STATE_SIZE
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        writer.put_u32(BLOCK_MAP_COMPONENT_ID);
        writer.put_u32(BLOCK_MAP_MAJOR_VERSION);
        writer.put_u32(BLOCK_MAP_MINOR_VERSION);
        writer.put_u64(BLOCK_MAP_STATE_SIZE as u64);

        let before = writer.len();
        writer.put_u64(self.flat_page_origin);
        writer.put_u64(self.flat_page_count);
        writer.put_u64(self.root_origin);
        writer.put_u64(self.root_count);
        debug_assert_eq!(writer.len() - before, BLOCK_MAP_STATE_SIZE);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes);

        let id = reader.read_u32()?;
        if id != BLOCK_MAP_COMPONENT_ID {
            return Err(CodecError::InvalidField {
                field: "header.id",
                reason: "not a block map component",
            });
        }
        let major = reader.read_u32()?;
        let minor = reader.read_u32()?;
        if major != BLOCK_MAP_MAJOR_VERSION || minor != BLOCK_MAP_MINOR_VERSION {
            return Err(CodecError::InvalidField {
                field: "header.version",
                reason: "unsupported block map version",
            });
        }
        let size = reader.read_u64()?;

        let payload_start = reader.offset();
        let state = Self {
            flat_page_origin: reader.read_u64()?,
            flat_page_count: reader.read_u64()?,
            root_origin: reader.read_u64()?,
            root_count: reader.read_u64()?,
        };

        if state.flat_page_origin != BLOCK_MAP_FLAT_PAGE_ORIGIN {
            return Err(CodecError::InvalidField {
                field: "flat_page_origin",
                reason: "must be the canonical origin",
            });
        }
        if state.flat_page_count != 0 {
            return Err(CodecError::InvalidField {
                field: "flat_page_count",
                reason: "must be zero",
            });
        }

        let decoded = reader.offset() - payload_start;
        if size != decoded as u64 {
            return Err(CodecError::SizeMismatch {
                expected: usize::try_from(size).unwrap_or(usize::MAX),
                actual: decoded,
            });
        }
        Ok(state)
    }
}
