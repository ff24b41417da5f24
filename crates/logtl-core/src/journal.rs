//! On-device journal headers
//!
//! Every allocation in the circular log starts with one header page that
//! describes the data following it. A header with no extents is a wrap
//! marker: it records how many sectors at the end of the region were skipped
//! when the frontier went back to the base.
//!
//! ```text
//!  0       4       8       12      14      16                        4096
//!  +-------+-------+-------+-------+-------+-------------------------+
//!  | magic |  seq  |  crc  | n_ext | n_sec | extent records (u64 LE) |
//!  +-------+-------+-------+-------+-------+-------------------------+
//!
//!  extent record: bits 0..47 lba | bits 47..63 len | bit 63 dirty
//! ```
//!
//! The checksum is CRC32C over the whole page with the checksum field zeroed.

use crate::error::{BlockError, BlockResult};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use logtl_common::PAGE_SIZE;
use logtl_common::checksum::crc32c_with_zeroed_field;

/// Magic number for journal headers
pub const HEADER_MAGIC: u32 = 0x4c44_3353;

/// Header size in bytes
pub const HEADER_SIZE: usize = PAGE_SIZE as usize;

/// Header size in sectors
pub const HEADER_SECTORS: u64 = logtl_common::SECTORS_PER_PAGE;

/// Fixed fields before the extent records
const FIXED_SIZE: usize = 16;

/// Location of the checksum field
const CRC_FIELD: std::ops::Range<usize> = 8..12;

/// Extent records that fit in one header
pub const MAX_HEADER_EXTENTS: usize = (HEADER_SIZE - FIXED_SIZE) / 8; // 510

const LBA_BITS: u32 = 47;
const LBA_MASK: u64 = (1 << LBA_BITS) - 1;
const LEN_MASK: u64 = 0xFFFF;
const DIRTY_BIT: u64 = 1 << 63;

/// One extent record inside a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderExtent {
    /// First logical sector
    pub lba: u64,
    /// Length in sectors
    pub len: u16,
    /// Reserved flag, carried through unchanged
    pub dirty: bool,
}

impl HeaderExtent {
    fn pack(self) -> BlockResult<u64> {
        if self.lba > LBA_MASK {
            return Err(BlockError::Journal(format!(
                "lba {} does not fit in {LBA_BITS} bits",
                self.lba
            )));
        }
        let dirty = if self.dirty { DIRTY_BIT } else { 0 };
        Ok(self.lba | (u64::from(self.len) << LBA_BITS) | dirty)
    }

    const fn unpack(raw: u64) -> Self {
        Self {
            lba: raw & LBA_MASK,
            len: ((raw >> LBA_BITS) & LEN_MASK) as u16,
            dirty: raw & DIRTY_BIT != 0,
        }
    }
}

/// Decoded journal header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    /// Monotonic header sequence number
    pub sequence: u32,
    /// Data sectors described, or dead sectors skipped for a wrap marker
    pub sector_count: u16,
    /// Extent records
    pub extents: Vec<HeaderExtent>,
}

impl JournalHeader {
    /// Header for a single write of `sectors` at `lba`
    #[must_use]
    pub fn data(sequence: u32, lba: u64, sectors: u16) -> Self {
        Self {
            sequence,
            sector_count: sectors,
            extents: vec![HeaderExtent {
                lba,
                len: sectors,
                dirty: false,
            }],
        }
    }

    /// Wrap marker covering `dead_sectors` at the end of the region
    #[must_use]
    pub const fn wrap_marker(sequence: u32, dead_sectors: u16) -> Self {
        Self {
            sequence,
            sector_count: dead_sectors,
            extents: Vec::new(),
        }
    }

    /// Check if this header marks a wrap
    #[must_use]
    pub fn is_wrap_marker(&self) -> bool {
        self.extents.is_empty()
    }

    /// Encode into a signed page
    pub fn encode(&self) -> BlockResult<Bytes> {
        if self.extents.len() > MAX_HEADER_EXTENTS {
            return Err(BlockError::Journal(format!(
                "{} extents exceed header capacity {MAX_HEADER_EXTENTS}",
                self.extents.len()
            )));
        }

        let mut page = BytesMut::with_capacity(HEADER_SIZE);
        page.put_u32_le(HEADER_MAGIC);
        page.put_u32_le(self.sequence);
        page.put_u32_le(0); // checksum, patched below
        page.put_u16_le(self.extents.len() as u16);
        page.put_u16_le(self.sector_count);
        for extent in &self.extents {
            page.put_u64_le(extent.pack()?);
        }
        page.resize(HEADER_SIZE, 0);

        let crc = crc32c_with_zeroed_field(&page, CRC_FIELD);
        page[CRC_FIELD].copy_from_slice(&crc.to_le_bytes());
        Ok(page.freeze())
    }

    /// Decode and verify a header page
    pub fn decode(page: &[u8]) -> BlockResult<Self> {
        if page.len() < HEADER_SIZE {
            return Err(BlockError::Journal(format!(
                "short header: {} bytes",
                page.len()
            )));
        }
        let page = &page[..HEADER_SIZE];

        let mut cursor = page;
        let magic = cursor.get_u32_le();
        if magic != HEADER_MAGIC {
            return Err(BlockError::Journal(format!("bad magic {magic:#010x}")));
        }
        let sequence = cursor.get_u32_le();
        let stored_crc = cursor.get_u32_le();
        let count = usize::from(cursor.get_u16_le());
        let sector_count = cursor.get_u16_le();

        let actual = crc32c_with_zeroed_field(page, CRC_FIELD);
        if actual != stored_crc {
            return Err(logtl_common::Error::ChecksumMismatch {
                expected: stored_crc,
                actual,
            }
            .into());
        }
        if count > MAX_HEADER_EXTENTS {
            return Err(BlockError::Journal(format!(
                "extent count {count} exceeds header capacity"
            )));
        }

        let extents = (0..count)
            .map(|_| HeaderExtent::unpack(cursor.get_u64_le()))
            .collect();
        Ok(Self {
            sequence,
            sector_count,
            extents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_header_layout() {
        let page = JournalHeader::data(7, 100, 8).encode().unwrap();
        assert_eq!(page.len(), HEADER_SIZE);
        assert_eq!(&page[0..4], &HEADER_MAGIC.to_le_bytes());
        assert_eq!(&page[4..8], &7u32.to_le_bytes());
        assert_eq!(&page[12..14], &1u16.to_le_bytes());
        assert_eq!(&page[14..16], &8u16.to_le_bytes());
        assert_eq!(&page[16..24], &(100u64 | (8u64 << 47)).to_le_bytes());
        assert!(page[24..].iter().all(|&b| b == 0));

        let mut zeroed = page.to_vec();
        zeroed[8..12].fill(0);
        assert_eq!(&page[8..12], &crc32c::crc32c(&zeroed).to_le_bytes());
    }

    #[test]
    fn test_decode_verifies() {
        let header = JournalHeader {
            sequence: 42,
            sector_count: 24,
            extents: vec![
                HeaderExtent {
                    lba: LBA_MASK,
                    len: 16,
                    dirty: true,
                },
                HeaderExtent {
                    lba: 0,
                    len: 8,
                    dirty: false,
                },
            ],
        };
        let page = header.encode().unwrap();
        assert_eq!(JournalHeader::decode(&page).unwrap(), header);

        let mut corrupt = page.to_vec();
        corrupt[100] ^= 1;
        let err = JournalHeader::decode(&corrupt).unwrap_err();
        assert!(matches!(
            err,
            BlockError::Common(ref e) if e.is_corruption()
        ));

        let mut bad_magic = page.to_vec();
        bad_magic[0] = 0;
        assert!(matches!(
            JournalHeader::decode(&bad_magic),
            Err(BlockError::Journal(_))
        ));
        assert!(JournalHeader::decode(&page[..512]).is_err());
    }

    #[test]
    fn test_wrap_marker() {
        let page = JournalHeader::wrap_marker(3, 40).encode().unwrap();
        let decoded = JournalHeader::decode(&page).unwrap();
        assert!(decoded.is_wrap_marker());
        assert_eq!(decoded.sector_count, 40);
        assert_eq!(decoded.sequence, 3);
    }

    #[test]
    fn test_rejects_unencodable() {
        assert!(JournalHeader::data(1, LBA_MASK + 1, 8).encode().is_err());

        let full = JournalHeader {
            sequence: 1,
            sector_count: 0,
            extents: vec![
                HeaderExtent {
                    lba: 0,
                    len: 1,
                    dirty: false,
                };
                MAX_HEADER_EXTENTS + 1
            ],
        };
        assert!(full.encode().is_err());
    }
}
