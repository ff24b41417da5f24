//! Read routing across the WRITE and READ indices
//!
//! A read is cut into segments that either map to one physical range or
//! have no known mapping (a fault). Both indices are consulted at every cut:
//!
//! - if only one index has an extent at or after the cursor, use it
//! - WRITE wins when it already covers the cursor
//! - otherwise READ wins when it covers the cursor
//! - otherwise whichever starts first inside the request wins, WRITE on a tie
//!
//! A READ extent is never allowed to run into the next WRITE extent; it is
//! truncated where the WRITE extent begins.

use crate::index::ExtentIndex;

use logtl_common::Extent;

/// One piece of a routed read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSegment {
    /// Sectors available on the device at `pba`
    Mapped { lba: u64, pba: u64, len: u32 },
    /// Sectors with no mapping; handed to the control plane
    Fault { lba: u64, len: u32 },
}

impl ReadSegment {
    /// First logical sector of the segment
    #[must_use]
    pub const fn lba(&self) -> u64 {
        match *self {
            Self::Mapped { lba, .. } | Self::Fault { lba, .. } => lba,
        }
    }

    /// Length in sectors
    #[must_use]
    pub const fn len(&self) -> u32 {
        match *self {
            Self::Mapped { len, .. } | Self::Fault { len, .. } => len,
        }
    }

    /// Check if the segment is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the segment needs the control plane
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        matches!(self, Self::Fault { .. })
    }
}

/// Choose the extent that serves `cursor` within a request ending at `end`
fn select(write: Option<Extent>, read: Option<Extent>, cursor: u64, end: u64) -> Option<Extent> {
    let (w, r) = match (write, read) {
        (Some(w), Some(r)) => (w, r),
        (w, r) => return w.or(r),
    };

    let chosen = if w.lba <= cursor {
        w
    } else if r.lba <= cursor {
        r
    } else if w.lba < end {
        if r.lba < w.lba { r } else { w }
    } else if r.lba < end {
        r
    } else {
        return None;
    };

    // chosen is READ only when the WRITE extent starts after it
    if chosen == r && w.lba > r.lba && r.end() > w.lba {
        return Some(Extent::new(r.lba, r.pba, (w.lba - r.lba) as u32));
    }
    Some(chosen)
}

/// Split `[lba, lba + len)` into mapped and faulted segments
#[must_use]
pub fn route_read(writes: &ExtentIndex, reads: &ExtentIndex, lba: u64, len: u32) -> Vec<ReadSegment> {
    let end = lba + u64::from(len);
    let mut segments = Vec::new();
    let mut cursor = lba;

    while cursor < end {
        let w = writes.query_at_or_after(cursor);
        let r = reads.query_at_or_after(cursor);

        match select(w, r, cursor, end) {
            Some(extent) if extent.lba < end => {
                if extent.lba > cursor {
                    segments.push(ReadSegment::Fault {
                        lba: cursor,
                        len: (extent.lba - cursor) as u32,
                    });
                    cursor = extent.lba;
                } else {
                    let stop = extent.end().min(end);
                    segments.push(ReadSegment::Mapped {
                        lba: cursor,
                        pba: extent.translate(cursor),
                        len: (stop - cursor) as u32,
                    });
                    cursor = stop;
                }
            }
            _ => {
                segments.push(ReadSegment::Fault {
                    lba: cursor,
                    len: (end - cursor) as u32,
                });
                break;
            }
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ExtentPool;
    use logtl_common::MapKind;
    use std::sync::Arc;

    fn indices() -> (ExtentIndex, ExtentIndex) {
        let pool = Arc::new(ExtentPool::new(64));
        (
            ExtentIndex::new(MapKind::Write, pool.clone()),
            ExtentIndex::new(MapKind::Read, pool),
        )
    }

    fn mapped(lba: u64, pba: u64, len: u32) -> ReadSegment {
        ReadSegment::Mapped { lba, pba, len }
    }

    fn fault(lba: u64, len: u32) -> ReadSegment {
        ReadSegment::Fault { lba, len }
    }

    #[test]
    fn test_inside_write_extent_never_faults() {
        let (w, r) = indices();
        w.update_range(100, Some(5000), 64).unwrap();
        assert_eq!(route_read(&w, &r, 110, 8), vec![mapped(110, 5010, 8)]);
        assert_eq!(route_read(&w, &r, 100, 64), vec![mapped(100, 5000, 64)]);
    }

    #[test]
    fn test_outside_all_extents_faults_whole() {
        let (w, r) = indices();
        assert_eq!(route_read(&w, &r, 0, 16), vec![fault(0, 16)]);

        w.update_range(100, Some(5000), 8).unwrap();
        r.update_range(300, Some(9000), 8).unwrap();
        assert_eq!(route_read(&w, &r, 200, 16), vec![fault(200, 16)]);
        // extents beyond the request do not split it
        assert_eq!(route_read(&w, &r, 84, 16), vec![fault(84, 16)]);
    }

    #[test]
    fn test_straddle_splits_minimally() {
        let (w, r) = indices();
        w.update_range(100, Some(5000), 8).unwrap();
        w.update_range(108, Some(7000), 8).unwrap();

        assert_eq!(
            route_read(&w, &r, 96, 24),
            vec![
                fault(96, 4),
                mapped(100, 5000, 8),
                mapped(108, 7000, 8),
                fault(116, 4),
            ]
        );
    }

    #[test]
    fn test_write_overrides_read() {
        let (w, r) = indices();
        r.update_range(0, Some(9000), 64).unwrap();
        w.update_range(16, Some(5000), 8).unwrap();

        assert_eq!(
            route_read(&w, &r, 0, 32),
            vec![
                mapped(0, 9000, 16),
                mapped(16, 5000, 8),
                mapped(24, 9024, 8),
            ]
        );
    }

    #[test]
    fn test_read_earlier_than_write_inside_window() {
        let (w, r) = indices();
        r.update_range(4, Some(9000), 32).unwrap();
        w.update_range(8, Some(5000), 8).unwrap();

        assert_eq!(
            route_read(&w, &r, 0, 16),
            vec![fault(0, 4), mapped(4, 9000, 4), mapped(8, 5000, 8)]
        );
    }

    #[test]
    fn test_tie_prefers_write() {
        let (w, r) = indices();
        r.update_range(8, Some(9000), 8).unwrap();
        w.update_range(8, Some(5000), 4).unwrap();

        assert_eq!(
            route_read(&w, &r, 0, 16),
            vec![fault(0, 8), mapped(8, 5000, 4), mapped(12, 9004, 4)]
        );
    }

    #[test]
    fn test_read_only_mapping() {
        let (w, r) = indices();
        r.update_range(200, Some(9000), 8).unwrap();
        assert_eq!(route_read(&w, &r, 200, 8), vec![mapped(200, 9000, 8)]);
    }

    #[test]
    fn test_segments_cover_request() {
        let (w, r) = indices();
        w.update_range(10, Some(100), 5).unwrap();
        r.update_range(12, Some(900), 20).unwrap();
        w.update_range(40, Some(300), 3).unwrap();

        let segments = route_read(&w, &r, 0, 64);
        let mut next = 0;
        for s in &segments {
            assert_eq!(s.lba(), next);
            assert!(!s.is_empty());
            next += u64::from(s.len());
        }
        assert_eq!(next, 64);
        assert_eq!(segments.iter().filter(|s| s.is_fault()).count(), 3);
    }
}
