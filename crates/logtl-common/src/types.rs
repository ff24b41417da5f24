//! Core type definitions for logtl
//!
//! Addresses are expressed in 512-byte sectors throughout. Logical block
//! addresses (LBAs) live in the client-visible space; physical block
//! addresses (PBAs) point into the backing device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sector size in bytes
pub const SECTOR_SIZE: u64 = 512;

/// Page size in bytes (one journal header)
pub const PAGE_SIZE: u64 = 4096;

/// Sectors per page
pub const SECTORS_PER_PAGE: u64 = PAGE_SIZE / SECTOR_SIZE; // 8

/// Wire sentinel for "explicitly unmapped" (punch/trim marker).
///
/// Inside the crate an unmapped range is passed as `None`; this value is
/// only used where a raw PBA must be carried: a resolution handed back by the
/// control plane with this PBA drops the READ mapping for its range.
pub const PBA_NONE: u64 = 0x7F << 40;

/// Round `value` up to a multiple of `align` (`align` must be non-zero)
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Convert a sector count to bytes
#[inline]
#[must_use]
pub const fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors * SECTOR_SIZE
}

/// Which of the two extent indices an operation addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    /// Control-plane supplied resolutions (subordinate)
    Read,
    /// Locally written data (authoritative)
    Write,
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A contiguous run of `len` logical sectors starting at `lba`, stored at
/// physical sectors starting at `pba`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// First logical sector
    pub lba: u64,
    /// First physical sector
    pub pba: u64,
    /// Length in sectors (never zero inside an index)
    pub len: u32,
}

impl Extent {
    /// Create a new extent
    #[must_use]
    pub const fn new(lba: u64, pba: u64, len: u32) -> Self {
        Self { lba, pba, len }
    }

    /// End of the logical range (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.lba + self.len as u64
    }

    /// End of the physical range (exclusive)
    #[must_use]
    pub const fn pba_end(&self) -> u64 {
        self.pba + self.len as u64
    }

    /// Check if this extent maps `lba`
    #[must_use]
    pub const fn contains(&self, lba: u64) -> bool {
        lba >= self.lba && lba < self.end()
    }

    /// Check if the logical range overlaps `[lba, lba + len)`
    #[must_use]
    pub const fn overlaps(&self, lba: u64, len: u64) -> bool {
        self.lba < lba + len && lba < self.end()
    }

    /// Check if the physical range overlaps `[low, high)`
    #[must_use]
    pub const fn overlaps_pba(&self, low: u64, high: u64) -> bool {
        self.pba < high && low < self.pba_end()
    }

    /// Physical sector backing `lba`; caller guarantees `contains(lba)`
    #[must_use]
    pub const fn translate(&self, lba: u64) -> u64 {
        self.pba + (lba - self.lba)
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent({}+{} -> {})", self.lba, self.len, self.pba)
    }
}
