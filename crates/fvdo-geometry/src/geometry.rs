//! The volume geometry block.
//!
//! Block 0 of the backing device carries a fixed little-endian record
//! describing the device layout: identity (release version, nonce,
//! uuid), the region table splitting the device into an index region and
//! a data region, and the dedupe-index sizing parameters. A CRC32C of
//! the packed payload trails the record.

use crate::{CodecError, FieldReader, FieldWriter, Result};
use fvdo_types::BlockNumber;

/// The geometry block always lives at block 0.
pub const GEOMETRY_BLOCK_LOCATION: BlockNumber = BlockNumber(0);

/// Signature opening the geometry record.
pub const GEOMETRY_MAGIC: [u8; 8] = *b"fvdogeo1";

/// Identity of one region in the table, stored in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegionId {
    Index = 0,
    Data = 1,
}

/// One entry of the region table. The region extends from `start_block`
/// to the start of the next region (or the end of the device for the
/// last one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRegion {
    pub id: RegionId,
    pub start_block: BlockNumber,
}

/// Sizing parameters handed to the dedupe index collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Memory size selector, in the index's own units.
    pub mem: u32,
    pub checkpoint_frequency: u32,
    pub sparse: bool,
}

/// Decoded contents of the geometry block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub release_version: u32,
    pub nonce: u64,
    pub uuid: [u8; 16],
    /// Regions in id order: index first, then data.
    pub regions: [VolumeRegion; 2],
    pub index_config: IndexConfig,
}

impl VolumeGeometry {
    #[must_use]
    pub fn index_region_offset(&self) -> BlockNumber {
        self.regions[RegionId::Index as usize].start_block
    }

    #[must_use]
    pub fn data_region_offset(&self) -> BlockNumber {
        self.regions[RegionId::Data as usize].start_block
    }

    /// Size of the index region in blocks.
    #[must_use]
    pub fn index_region_size(&self) -> u64 {
        self.data_region_offset()
            .0
            .saturating_sub(self.index_region_offset().0)
    }

    /// Pack this geometry into its on-disk byte form, checksum included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        writer.put_bytes(&GEOMETRY_MAGIC);
        writer.put_u32(self.release_version);
        writer.put_u64(self.nonce);
        writer.put_bytes(&self.uuid);
        for region in &self.regions {
            writer.put_u32(region.id as u32);
            writer.put_u64(region.start_block.0);
        }
        writer.put_u32(self.index_config.mem);
        writer.put_u32(self.index_config.checkpoint_frequency);
        writer.put_u8(u8::from(self.index_config.sparse));

        let mut bytes = writer.into_bytes();
        let checksum = crc32c::crc32c(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Decode and validate a geometry record from the start of `block`.
    ///
    /// Trailing bytes past the record (the rest of the device block) are
    /// ignored.
    pub fn decode(block: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(block);
        let magic: [u8; 8] = reader.read_array()?;
        if magic != GEOMETRY_MAGIC {
            return Err(CodecError::InvalidMagic);
        }

        let release_version = reader.read_u32()?;
        let nonce = reader.read_u64()?;
        let uuid: [u8; 16] = reader.read_array()?;

        let mut regions = [VolumeRegion {
            id: RegionId::Index,
            start_block: BlockNumber(0),
        }; 2];
        for (expected, slot) in [RegionId::Index, RegionId::Data].into_iter().zip(&mut regions) {
            let id = reader.read_u32()?;
            if id != expected as u32 {
                return Err(CodecError::InvalidField {
                    field: "region_table",
                    reason: "regions must appear in id order",
                });
            }
            *slot = VolumeRegion {
                id: expected,
                start_block: BlockNumber(reader.read_u64()?),
            };
        }

        let index_config = IndexConfig {
            mem: reader.read_u32()?,
            checkpoint_frequency: reader.read_u32()?,
            sparse: match reader.read_u8()? {
                0 => false,
                1 => true,
                _ => {
                    return Err(CodecError::InvalidField {
                        field: "index_config.sparse",
                        reason: "must be 0 or 1",
                    })
                }
            },
        };

        let payload_len = reader.offset();
        let stored = reader.read_u32()?;
        let computed = crc32c::crc32c(&block[..payload_len]);
        if stored != computed {
            return Err(CodecError::ChecksumMismatch { stored, computed });
        }

        let geometry = Self {
            release_version,
            nonce,
            uuid,
            regions,
            index_config,
        };
        if geometry.data_region_offset() < geometry.index_region_offset() {
            return Err(CodecError::InvalidField {
                field: "region_table",
                reason: "data region must not precede the index region",
            });
        }
        Ok(geometry)
    }
}
