//! Circular log space allocation and octant trim scheduling
//!
//! The log region `[base, bound)` is written strictly sequentially. Each
//! allocation takes one header page followed by the data rounded up to whole
//! pages. When an allocation would run into `bound` the frontier returns to
//! `base`, and a wrap marker is written over the skipped tail.
//!
//! The region is split into eight octants. `trim_cursor` names the oldest
//! octant that may still hold live data. As soon as the frontier enters the
//! octant just before it, that octant is reclaimed: WRITE extents stored there
//! are dropped, together with READ extents for the same LBAs.
//!
//! An allocation pins the octants it touches until its writer calls
//! [`LogAllocator::release`]. The trim of a pinned octant is refused with
//! `TryLater`, so the frontier never re-enters log space whose previous
//! occupant has not committed yet. Reclaim runs inside the allocation
//! critical section; lock order is allocator, then WRITE, then READ.
//!
//! ```text
//!   base                                                           bound
//!    | oct 0 | oct 1 | oct 2 | oct 3 | oct 4 | oct 5 | oct 6 | oct 7 |
//!                                                        ^frontier
//!    trim_cursor = 0: frontier entering octant 7 reclaims octant 0
//! ```

use crate::error::{BlockError, BlockResult};
use crate::index::ExtentIndex;
use crate::journal::HEADER_SECTORS;

use logtl_common::{SECTORS_PER_PAGE, align_up};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Number of trim slices the log is divided into
pub const OCTANTS: u64 = 8;

/// Log sectors consumed by a write of `sectors`: the data rounded up to whole
/// pages, plus its header.
#[must_use]
pub const fn log_footprint(sectors: u32) -> u64 {
    align_up(sectors as u64, SECTORS_PER_PAGE) + HEADER_SECTORS
}

/// Physical range of one octant due for reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRange {
    /// Octant number (0..8)
    pub octant: u64,
    /// First sector of the octant
    pub low: u64,
    /// End of the octant (exclusive)
    pub high: u64,
}

/// Dead tail skipped by a wrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapMarker {
    /// Where the marker header goes (the old frontier)
    pub pba: u64,
    /// Sectors from the old frontier to the bound
    pub sectors: u64,
    /// Sequence number for the marker header
    pub sequence: u32,
}

/// Result of a single allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Header page position
    pub header_pba: u64,
    /// First data sector (directly after the header)
    pub data_pba: u64,
    /// Sequence number for the data header
    pub sequence: u32,
    /// Wrap marker to write, if this allocation wrapped
    pub wrap: Option<WrapMarker>,
    /// Octant reclaimed by this allocation, if it crossed into the trim boundary
    pub trim: Option<TrimRange>,
    /// Octants held until release, one bit each
    pinned: u8,
}

#[derive(Debug)]
struct LogState {
    frontier: u64,
    trim_cursor: u64,
    /// Uncommitted allocations touching each octant
    in_flight: [u32; OCTANTS as usize],
}

/// Allocator for the circular write log
#[derive(Debug)]
pub struct LogAllocator {
    base: u64,
    bound: u64,
    state: Mutex<LogState>,
    sequence: AtomicU32,
}

impl LogAllocator {
    /// Create an allocator for `[base, bound)`
    pub fn new(base: u64, bound: u64) -> BlockResult<Self> {
        if base >= bound || base % SECTORS_PER_PAGE != 0 || bound % SECTORS_PER_PAGE != 0 {
            return Err(BlockError::invalid(format!(
                "log region [{base}, {bound}) must be non-empty and page aligned"
            )));
        }
        if (bound - base) / OCTANTS <= HEADER_SECTORS {
            return Err(BlockError::invalid(format!(
                "log region [{base}, {bound}) is too small"
            )));
        }
        Ok(Self {
            base,
            bound,
            state: Mutex::new(LogState {
                frontier: base,
                trim_cursor: 0,
                in_flight: [0; OCTANTS as usize],
            }),
            sequence: AtomicU32::new(0),
        })
    }

    /// Allocate room for a header plus `sectors` of data.
    ///
    /// When the allocation crosses into the trim boundary, `reclaim` runs on
    /// the due octant before the allocator lock is dropped. Fails with
    /// `TryLater` if that octant still holds an unreleased allocation; the
    /// allocator is left unchanged.
    pub fn allocate(
        &self,
        sectors: u32,
        reclaim: impl FnOnce(TrimRange),
    ) -> BlockResult<Allocation> {
        let quantum = align_up(u64::from(sectors), SECTORS_PER_PAGE);
        let footprint = quantum + HEADER_SECTORS;

        let mut state = self.state.lock();

        let wraps = state.frontier + footprint >= self.bound;
        let header_pba = if wraps { self.base } else { state.frontier };
        let frontier = header_pba + footprint;

        let octant = self.octant_of(frontier);
        let trim_due = (octant + 1) % OCTANTS == state.trim_cursor;
        if trim_due && state.in_flight[state.trim_cursor as usize] > 0 {
            debug!(
                "octant {} still has uncommitted writes, holding the frontier at {}",
                state.trim_cursor, state.frontier
            );
            return Err(BlockError::TryLater("log octant busy"));
        }

        let wrap = wraps.then(|| WrapMarker {
            pba: state.frontier,
            sectors: self.bound - state.frontier,
            sequence: self.next_sequence(),
        });
        state.frontier = frontier;

        let mut trim = None;
        if trim_due {
            let range = self.octant_range(state.trim_cursor);
            reclaim(range);
            trim = Some(range);
            state.trim_cursor = (state.trim_cursor + 1) % OCTANTS;
        }

        let mut pinned = (self.octant_of(header_pba)..=self.octant_of(frontier - 1))
            .fold(0u8, |mask, n| mask | (1 << n));
        if let Some(marker) = &wrap {
            pinned |= 1 << self.octant_of(marker.pba);
        }
        for n in pinned_octants(pinned) {
            state.in_flight[n] += 1;
        }
        drop(state);

        if let Some(marker) = wrap {
            debug!(
                "log wrapped at {} ({} dead sectors)",
                marker.pba, marker.sectors
            );
        }

        Ok(Allocation {
            header_pba,
            data_pba: header_pba + HEADER_SECTORS,
            sequence: self.next_sequence(),
            wrap,
            trim,
            pinned,
        })
    }

    /// Unpin the octants of `alloc` once its writes have committed or failed
    pub fn release(&self, alloc: &Allocation) {
        let mut state = self.state.lock();
        for n in pinned_octants(alloc.pinned) {
            debug_assert!(state.in_flight[n] > 0);
            state.in_flight[n] = state.in_flight[n].saturating_sub(1);
        }
    }

    fn octant_of(&self, pba: u64) -> u64 {
        ((pba - self.base) * OCTANTS / self.span()).min(OCTANTS - 1)
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Physical range of octant `n`
    #[must_use]
    pub const fn octant_range(&self, n: u64) -> TrimRange {
        let low = self.base + n * self.span() / OCTANTS;
        TrimRange {
            octant: n,
            low,
            high: low + self.span() / OCTANTS,
        }
    }

    /// First sector of the region
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// End of the region (exclusive)
    #[must_use]
    pub const fn bound(&self) -> u64 {
        self.bound
    }

    /// Region size in sectors
    #[must_use]
    pub const fn span(&self) -> u64 {
        self.bound - self.base
    }

    /// Next write position
    #[must_use]
    pub fn frontier(&self) -> u64 {
        self.state.lock().frontier
    }

    /// Oldest octant not yet reclaimed
    #[must_use]
    pub fn trim_cursor(&self) -> u64 {
        self.state.lock().trim_cursor
    }
}

fn pinned_octants(mask: u8) -> impl Iterator<Item = usize> {
    (0..OCTANTS as usize).filter(move |n| mask & (1 << n) != 0)
}

/// Reclaim one octant from both indices.
///
/// WRITE extents stored in the octant are removed, and so is every READ
/// extent overlapping their LBAs. Locks WRITE before READ.
pub fn reclaim(writes: &ExtentIndex, reads: &ExtentIndex, range: TrimRange) -> (usize, usize) {
    let mut write_map = writes.lock();
    let mut read_map = reads.lock();

    let dropped = write_map.remove_range_by_pba(range.low, range.high);
    let stale: usize = dropped
        .iter()
        .map(|e| read_map.remove_overlapping(e.lba, u64::from(e.len)))
        .sum();

    debug!(
        "trimmed octant {} [{}, {}): {} write extents, {} read extents",
        range.octant,
        range.low,
        range.high,
        dropped.len(),
        stale
    );
    (dropped.len(), stale)
}
