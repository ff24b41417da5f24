//! Translator statistics

use crate::admission::AdmissionStats;
use crate::exchange::QueueDepths;

use std::sync::atomic::{AtomicU64, Ordering};

/// Running I/O counters
#[derive(Debug, Default)]
pub struct IoCounters {
    /// Completed client writes
    write_ops: AtomicU64,
    /// Sectors written by completed client writes
    write_sectors: AtomicU64,
    /// Client writes that failed on the device or at commit
    write_errors: AtomicU64,
    /// Completed client reads
    read_ops: AtomicU64,
    /// Sectors returned by completed client reads
    read_sectors: AtomicU64,
    /// Reads that failed
    read_errors: AtomicU64,
    /// Fault ranges parked for the control plane
    faults: AtomicU64,
    /// Extents accepted through resolve
    resolved_extents: AtomicU64,
    /// Octants reclaimed
    trims: AtomicU64,
    /// WRITE extents dropped by trim
    trimmed_extents: AtomicU64,
    /// Log wraps
    wraps: AtomicU64,
}

impl IoCounters {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, sectors: u64) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.write_sectors.fetch_add(sectors, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, sectors: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.read_sectors.fetch_add(sectors, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved(&self, extents: u64) {
        self.resolved_extents.fetch_add(extents, Ordering::Relaxed);
    }

    pub fn record_trim(&self, extents: u64) {
        self.trims.fetch_add(1, Ordering::Relaxed);
        self.trimmed_extents.fetch_add(extents, Ordering::Relaxed);
    }

    pub fn record_wrap(&self) {
        self.wraps.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> IoSnapshot {
        IoSnapshot {
            write_ops: self.write_ops.load(Ordering::Relaxed),
            write_sectors: self.write_sectors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            read_sectors: self.read_sectors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            resolved_extents: self.resolved_extents.load(Ordering::Relaxed),
            trims: self.trims.load(Ordering::Relaxed),
            trimmed_extents: self.trimmed_extents.load(Ordering::Relaxed),
            wraps: self.wraps.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`IoCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSnapshot {
    pub write_ops: u64,
    pub write_sectors: u64,
    pub write_errors: u64,
    pub read_ops: u64,
    pub read_sectors: u64,
    pub read_errors: u64,
    pub faults: u64,
    pub resolved_extents: u64,
    pub trims: u64,
    pub trimmed_extents: u64,
    pub wraps: u64,
}

/// Full translator state for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub queues: QueueDepths,
    pub admission: AdmissionStats,
    /// Next write position in the log
    pub frontier: u64,
    /// Oldest octant not yet reclaimed
    pub trim_cursor: u64,
    pub write_extents: usize,
    pub read_extents: usize,
    /// Extent nodes in use across both indices
    pub extent_nodes: usize,
    pub io: IoSnapshot,
}
