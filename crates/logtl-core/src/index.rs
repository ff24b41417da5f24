//! Extent index: ordered, non-overlapping LBA -> PBA interval map
//!
//! Two instances exist per translator. The WRITE index records where locally
//! written data lives in the log; the READ index caches resolutions supplied
//! by the control plane and is subordinate to WRITE when routing reads.
//!
//! ```text
//!  update_range(lba, pba, len) against existing extents
//!
//!  split-contains    [----------------------]     [-----][+++++][--------]
//!                           [++++++]           ->
//!  left-overlap      [------------]
//!                           [+++++++++]        -> [------][+++++++++]
//!  covered chain           [---] [--]
//!                       [+++++++++++]          ->    [+++++++++++]
//!  right remainder              [-------]
//!                       [+++++++++]            ->    [+++++++++][---]
//! ```
//!
//! Nodes come from a fixed-capacity [`ExtentPool`] shared by both indices.
//! An update plans its whole mutation, reserves the net number of nodes it
//! needs, and only then touches the map, so exhaustion leaves the index as it
//! was.

use crate::error::{BlockError, BlockResult};

use logtl_common::{Extent, MapKind};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Fixed-capacity budget of extent nodes
#[derive(Debug)]
pub struct ExtentPool {
    capacity: usize,
    in_use: AtomicUsize,
}

impl ExtentPool {
    /// Create a pool holding at most `capacity` live extents
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Try to take `count` nodes; fails without side effects if unavailable
    fn try_reserve(&self, count: usize) -> bool {
        loop {
            let current = self.in_use.load(Ordering::Relaxed);
            if current + count > self.capacity {
                return false;
            }
            if self
                .in_use
                .compare_exchange_weak(
                    current,
                    current + count,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Return `count` nodes to the pool
    fn release(&self, count: usize) {
        if count > 0 {
            self.in_use.fetch_sub(count, Ordering::AcqRel);
        }
    }

    /// Total capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Nodes currently held by live extents
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Nodes still available
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    pba: u64,
    len: u32,
}

impl Node {
    const fn extent(self, lba: u64) -> Extent {
        Extent::new(lba, self.pba, self.len)
    }
}

/// Narrow a sector count known to fit an existing extent length
#[inline]
fn narrow(sectors: u64) -> u32 {
    debug_assert!(sectors <= u64::from(u32::MAX));
    sectors as u32
}

/// Unsynchronized map contents; reached through [`ExtentIndex::lock`]
#[derive(Debug)]
pub struct IndexMap {
    kind: MapKind,
    by_lba: BTreeMap<u64, Node>,
    /// Secondary ordering for physical-range removal: (pba, lba)
    by_pba: BTreeSet<(u64, u64)>,
    /// Longest extent ever inserted; bounds the backwards scan in `by_pba`
    longest: u32,
    pool: Arc<ExtentPool>,
}

impl IndexMap {
    fn new(kind: MapKind, pool: Arc<ExtentPool>) -> Self {
        Self {
            kind,
            by_lba: BTreeMap::new(),
            by_pba: BTreeSet::new(),
            longest: 0,
            pool,
        }
    }

    fn insert_node(&mut self, extent: Extent) {
        debug_assert!(extent.len > 0);
        self.longest = self.longest.max(extent.len);
        self.by_pba.insert((extent.pba, extent.lba));
        self.by_lba.insert(
            extent.lba,
            Node {
                pba: extent.pba,
                len: extent.len,
            },
        );
    }

    fn remove_node(&mut self, lba: u64) -> Option<Extent> {
        let node = self.by_lba.remove(&lba)?;
        self.by_pba.remove(&(node.pba, lba));
        Some(node.extent(lba))
    }

    fn shrink_node(&mut self, lba: u64, len: u32) {
        if let Some(node) = self.by_lba.get_mut(&lba) {
            node.len = len;
        }
    }

    /// Which index this is
    #[must_use]
    pub const fn kind(&self) -> MapKind {
        self.kind
    }

    /// Number of extents
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_lba.len()
    }

    /// Check if the index holds no extents
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_lba.is_empty()
    }

    /// Iterate extents in LBA order
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_lba.iter().map(|(&lba, node)| node.extent(lba))
    }

    /// The extent containing `lba`, or else the one with the smallest start
    /// above `lba`.
    #[must_use]
    pub fn query_at_or_after(&self, lba: u64) -> Option<Extent> {
        if let Some((&start, node)) = self.by_lba.range(..=lba).next_back()
            && start + u64::from(node.len) > lba
        {
            return Some(node.extent(start));
        }
        self.by_lba
            .range(lba..)
            .next()
            .map(|(&start, node)| node.extent(start))
    }

    /// Map `[lba, lba + len)` to `pba`, or unmap it when `pba` is `None`.
    ///
    /// Overlapping extents are trimmed, split or removed so the index stays
    /// non-overlapping. Fails with [`BlockError::TryLater`] before any
    /// mutation when the node pool cannot cover the update.
    pub fn update_range(&mut self, lba: u64, pba: Option<u64>, len: u32) -> BlockResult<()> {
        if len == 0 {
            return Err(BlockError::invalid("zero-length extent"));
        }
        let end = lba + u64::from(len);

        let left = self
            .by_lba
            .range(..lba)
            .next_back()
            .map(|(&start, node)| node.extent(start))
            .filter(|e| e.end() > lba);
        let split = left.filter(|e| e.end() > end);
        let covered: Vec<Extent> = self
            .by_lba
            .range(lba..end)
            .map(|(&start, node)| node.extent(start))
            .collect();

        let removed = covered.iter().filter(|e| e.end() <= end).count();
        let added = usize::from(split.is_some()) + usize::from(pba.is_some());
        if added > removed && !self.pool.try_reserve(added - removed) {
            warn!(
                "{} index: extent pool exhausted ({} in use), refusing update {}+{}",
                self.kind,
                self.pool.in_use(),
                lba,
                len
            );
            return Err(BlockError::TryLater("extent pool"));
        }

        if let Some(left) = left {
            self.shrink_node(left.lba, narrow(lba - left.lba));
            if let Some(outer) = split {
                let cut = end - outer.lba;
                self.insert_node(Extent::new(
                    end,
                    outer.pba + cut,
                    narrow(outer.end() - end),
                ));
            }
        }

        for extent in covered {
            self.remove_node(extent.lba);
            if extent.end() > end {
                let cut = end - extent.lba;
                self.insert_node(Extent::new(
                    end,
                    extent.pba + cut,
                    extent.len - narrow(cut),
                ));
            }
        }

        if let Some(pba) = pba {
            self.insert_node(Extent::new(lba, pba, len));
        }

        if removed > added {
            self.pool.release(removed - added);
        }
        Ok(())
    }

    /// Remove every extent whose physical range overlaps `[low, high)`
    pub fn remove_range_by_pba(&mut self, low: u64, high: u64) -> Vec<Extent> {
        if low >= high {
            return Vec::new();
        }
        let scan_from = low.saturating_sub(u64::from(self.longest));
        let victims: Vec<Extent> = self
            .by_pba
            .range((scan_from, 0)..(high, 0))
            .filter_map(|&(_, lba)| self.by_lba.get(&lba).map(|node| node.extent(lba)))
            .filter(|e| e.overlaps_pba(low, high))
            .collect();

        for extent in &victims {
            self.remove_node(extent.lba);
        }
        self.pool.release(victims.len());
        victims
    }

    /// Remove every whole extent whose logical range overlaps
    /// `[lba, lba + len)`; returns how many were removed.
    pub fn remove_overlapping(&mut self, lba: u64, len: u64) -> usize {
        let mut removed = 0;
        while let Some(extent) = self.query_at_or_after(lba)
            && extent.overlaps(lba, len)
        {
            self.remove_node(extent.lba);
            removed += 1;
        }
        self.pool.release(removed);
        removed
    }

    /// Up to `max` extents starting with the one at or after `start`
    #[must_use]
    pub fn extents_from(&self, start: u64, max: usize) -> Vec<Extent> {
        let Some(first) = self.query_at_or_after(start) else {
            return Vec::new();
        };
        self.by_lba
            .range(first.lba..)
            .take(max)
            .map(|(&lba, node)| node.extent(lba))
            .collect()
    }

    /// Drop every extent
    pub fn clear(&mut self) {
        let count = self.by_lba.len();
        self.by_lba.clear();
        self.by_pba.clear();
        self.pool.release(count);
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut prev_end = 0u64;
        for extent in self.iter() {
            assert!(extent.len > 0, "zero-length extent {extent:?}");
            assert!(extent.lba >= prev_end, "overlap at {extent:?}");
            assert!(self.by_pba.contains(&(extent.pba, extent.lba)));
            prev_end = extent.end();
        }
        assert_eq!(self.by_pba.len(), self.by_lba.len());
    }
}

impl Drop for IndexMap {
    fn drop(&mut self) {
        self.pool.release(self.by_lba.len());
    }
}

/// Extent index guarded by its own lock
#[derive(Debug)]
pub struct ExtentIndex {
    inner: Mutex<IndexMap>,
}

impl ExtentIndex {
    /// Create an empty index drawing nodes from `pool`
    #[must_use]
    pub fn new(kind: MapKind, pool: Arc<ExtentPool>) -> Self {
        Self {
            inner: Mutex::new(IndexMap::new(kind, pool)),
        }
    }

    /// Lock the index for a multi-step operation.
    ///
    /// When both indices are needed, WRITE is locked before READ.
    pub fn lock(&self) -> MutexGuard<'_, IndexMap> {
        self.inner.lock()
    }

    /// See [`IndexMap::query_at_or_after`]
    #[must_use]
    pub fn query_at_or_after(&self, lba: u64) -> Option<Extent> {
        self.inner.lock().query_at_or_after(lba)
    }

    /// See [`IndexMap::update_range`]
    pub fn update_range(&self, lba: u64, pba: Option<u64>, len: u32) -> BlockResult<()> {
        self.inner.lock().update_range(lba, pba, len)
    }

    /// See [`IndexMap::remove_range_by_pba`]
    pub fn remove_range_by_pba(&self, low: u64, high: u64) -> Vec<Extent> {
        self.inner.lock().remove_range_by_pba(low, high)
    }

    /// See [`IndexMap::extents_from`]
    #[must_use]
    pub fn extents_from(&self, start: u64, max: usize) -> Vec<Extent> {
        self.inner.lock().extents_from(start, max)
    }

    /// Number of extents
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the index holds no extents
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every extent
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
