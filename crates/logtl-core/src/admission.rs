//! Write admission and backpressure
//!
//! The controller counts sectors admitted since the control plane last
//! drained completed writes. Once the count reaches `max_sectors`, new writes
//! wait in a FIFO queue. A drain first credits the sectors the control plane
//! received on its previous call, then releases queued writes while the
//! count stays below the ceiling. Sectors are only credited back one drain
//! late, so the queue does not flip between open and closed on every
//! completion.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Outcome of [`AdmissionController::admit`]
#[derive(Debug)]
pub enum Admission<W> {
    /// Submit now; its sectors have been counted
    Admitted(W),
    /// Parked in the undone queue
    Queued,
    /// Shutting down; the write is handed back to be failed
    Closed(W),
}

#[derive(Debug)]
struct AdmissionState<W> {
    admitted: u64,
    /// Sectors handed to the control plane by the previous drain
    delivered: u64,
    undone: VecDeque<(W, u64)>,
    undone_sectors: u64,
    closed: bool,
}

/// Snapshot of admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub admitted_sectors: u64,
    pub undone_writes: usize,
    pub undone_sectors: u64,
}

/// Bounded write admission with a FIFO overflow queue
#[derive(Debug)]
pub struct AdmissionController<W> {
    max_sectors: u64,
    state: Mutex<AdmissionState<W>>,
}

impl<W> AdmissionController<W> {
    /// Create a controller with the given ceiling
    #[must_use]
    pub const fn new(max_sectors: u64) -> Self {
        Self {
            max_sectors,
            state: Mutex::new(AdmissionState {
                admitted: 0,
                delivered: 0,
                undone: VecDeque::new(),
                undone_sectors: 0,
                closed: false,
            }),
        }
    }

    /// Admit `write` of `sectors`, or queue it behind earlier writes
    pub fn admit(&self, write: W, sectors: u64) -> Admission<W> {
        let mut state = self.state.lock();
        if state.closed {
            return Admission::Closed(write);
        }
        if state.admitted >= self.max_sectors || !state.undone.is_empty() {
            state.undone.push_back((write, sectors));
            state.undone_sectors += sectors;
            return Admission::Queued;
        }
        state.admitted += sectors;
        Admission::Admitted(write)
    }

    /// Credit last drain's deliveries and release queued writes.
    ///
    /// Released writes are already counted and must be submitted directly.
    pub fn drain(&self) -> Vec<W> {
        let mut state = self.state.lock();
        state.admitted = state.admitted.saturating_sub(state.delivered);
        state.delivered = 0;
        self.release_locked(&mut state)
    }

    /// Release queued writes that fit under the ceiling without crediting
    /// deliveries; used after a refund frees room.
    pub fn release(&self) -> Vec<W> {
        let mut state = self.state.lock();
        self.release_locked(&mut state)
    }

    fn release_locked(&self, state: &mut AdmissionState<W>) -> Vec<W> {
        let mut released = Vec::new();
        while state.admitted < self.max_sectors {
            let Some((write, sectors)) = state.undone.pop_front() else {
                break;
            };
            state.undone_sectors -= sectors;
            state.admitted += sectors;
            released.push(write);
        }
        released
    }

    /// Record sectors handed to the control plane; credited on the next drain
    pub fn mark_delivered(&self, sectors: u64) {
        self.state.lock().delivered += sectors;
    }

    /// Return the sectors of a write that failed and will never be delivered
    pub fn refund(&self, sectors: u64) {
        let mut state = self.state.lock();
        state.admitted = state.admitted.saturating_sub(sectors);
    }

    /// Refuse further admission and hand back every queued write
    pub fn close(&self) -> Vec<W> {
        let mut state = self.state.lock();
        state.closed = true;
        state.undone_sectors = 0;
        state.undone.drain(..).map(|(write, _)| write).collect()
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        AdmissionStats {
            admitted_sectors: state.admitted,
            undone_writes: state.undone.len(),
            undone_sectors: state.undone_sectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admitted(outcome: Admission<u32>) -> Option<u32> {
        match outcome {
            Admission::Admitted(w) => Some(w),
            _ => None,
        }
    }

    #[test]
    fn test_admits_below_ceiling() {
        let ctl = AdmissionController::new(16);
        assert_eq!(admitted(ctl.admit(1, 8)), Some(1));
        // still below the ceiling, may overshoot it
        assert_eq!(admitted(ctl.admit(2, 12)), Some(2));
        assert!(matches!(ctl.admit(3, 8), Admission::Queued));
        assert_eq!(ctl.stats().admitted_sectors, 20);
        assert_eq!(ctl.stats().undone_writes, 1);
    }

    #[test]
    fn test_queue_is_fifo_even_below_ceiling() {
        let ctl = AdmissionController::new(16);
        ctl.admit(1, 16);
        assert!(matches!(ctl.admit(2, 8), Admission::Queued));
        ctl.refund(16);
        // counter is zero but an older write is still waiting
        assert!(matches!(ctl.admit(3, 8), Admission::Queued));
        assert_eq!(ctl.drain(), vec![2, 3]);
    }

    #[test]
    fn test_drain_credits_one_call_late() {
        let ctl = AdmissionController::new(16);
        ctl.admit(1, 16);
        ctl.admit(2, 8);
        ctl.admit(3, 8);

        // nothing delivered yet
        assert!(ctl.drain().is_empty());

        ctl.mark_delivered(16);
        assert_eq!(ctl.drain(), vec![2, 3]);
        let stats = ctl.stats();
        assert_eq!(stats.admitted_sectors, 16);
        assert_eq!(stats.undone_writes, 0);
        assert_eq!(stats.undone_sectors, 0);
    }

    #[test]
    fn test_drain_stops_at_ceiling() {
        let ctl = AdmissionController::new(16);
        ctl.admit(1, 16);
        for w in 2..6 {
            ctl.admit(w, 8);
        }
        ctl.mark_delivered(16);
        assert_eq!(ctl.drain(), vec![2, 3]);
        assert_eq!(ctl.stats().undone_writes, 2);
    }

    #[test]
    fn test_release_after_refund_keeps_deliveries_pending() {
        let ctl = AdmissionController::new(16);
        ctl.admit(1, 8);
        ctl.admit(2, 8);
        assert!(matches!(ctl.admit(3, 8), Admission::Queued));
        ctl.mark_delivered(8);

        // write 2 failed
        ctl.refund(8);
        assert_eq!(ctl.release(), vec![3]);
        assert_eq!(ctl.stats().admitted_sectors, 16);

        // the delivery is credited on the next drain only
        assert!(ctl.drain().is_empty());
        assert_eq!(ctl.stats().admitted_sectors, 8);
    }

    #[test]
    fn test_close_returns_queued() {
        let ctl = AdmissionController::new(8);
        ctl.admit(1, 8);
        ctl.admit(2, 8);
        ctl.admit(3, 8);

        assert_eq!(ctl.close(), vec![2, 3]);
        assert!(matches!(ctl.admit(4, 8), Admission::Closed(4)));
        assert_eq!(ctl.stats().undone_sectors, 0);
    }
}
