//! Queues shared between the translator and the control plane
//!
//! Faulted reads move through two states: *pending* until a
//! [`FaultExchange::wait_for_reads`] call hands them out, then *faulted*
//! until a resolve replays them. Completed writes sit in the done queue
//! until [`FaultExchange::wait_for_writes`] consumes them.
//!
//! Waiters sleep on [`Notify`]; shutdown wakes every waiter and hands back
//! every parked read so it can be failed.

use crate::error::{BlockError, BlockResult};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::pin;
use tokio::sync::Notify;

/// A logical range the control plane must resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultRange {
    pub lba: u64,
    pub len: u32,
}

/// A completed write awaiting delivery to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteRecord {
    pub lba: u64,
    pub pba: u64,
    pub len: u32,
}

/// Queue depths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub pending_reads: usize,
    pub faulted_reads: usize,
    pub done_writes: usize,
}

#[derive(Debug)]
struct ExchangeState<R> {
    pending: VecDeque<(FaultRange, R)>,
    faulted: Vec<(FaultRange, R)>,
    done: VecDeque<WriteRecord>,
    shut_down: bool,
}

/// Fault and completion queues, generic over the parked read payload
#[derive(Debug)]
pub struct FaultExchange<R> {
    state: Mutex<ExchangeState<R>>,
    reads_ready: Notify,
    writes_ready: Notify,
}

impl<R> Default for FaultExchange<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> FaultExchange<R> {
    /// Create empty queues
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ExchangeState {
                pending: VecDeque::new(),
                faulted: Vec::new(),
                done: VecDeque::new(),
                shut_down: false,
            }),
            reads_ready: Notify::new(),
            writes_ready: Notify::new(),
        }
    }

    /// Park an unresolved read; returns it if shutting down
    pub fn park(&self, range: FaultRange, read: R) -> Result<(), R> {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(read);
            }
            state.pending.push_back((range, read));
        }
        self.reads_ready.notify_waiters();
        Ok(())
    }

    /// Publish a completed write
    pub fn push_done(&self, record: WriteRecord) {
        self.state.lock().done.push_back(record);
        self.writes_ready.notify_waiters();
    }

    /// Wait for completed writes and take up to `max` of them
    pub async fn wait_for_writes(&self, max: usize) -> BlockResult<Vec<WriteRecord>> {
        loop {
            let mut notified = pin!(self.writes_ready.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(BlockError::ShutDown);
                }
                if !state.done.is_empty() {
                    let n = max.min(state.done.len());
                    return Ok(state.done.drain(..n).collect());
                }
            }
            notified.await;
        }
    }

    /// Wait for pending faults and hand out up to `max` of them.
    ///
    /// Handed-out reads stay parked until [`Self::take_faulted`].
    pub async fn wait_for_reads(&self, max: usize) -> BlockResult<Vec<FaultRange>> {
        loop {
            let mut notified = pin!(self.reads_ready.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(BlockError::ShutDown);
                }
                if !state.pending.is_empty() {
                    let n = max.min(state.pending.len());
                    let moved: Vec<_> = state.pending.drain(..n).collect();
                    let ranges = moved.iter().map(|(range, _)| *range).collect();
                    state.faulted.extend(moved);
                    return Ok(ranges);
                }
            }
            notified.await;
        }
    }

    /// Take every read handed out to the control plane, for replay
    pub fn take_faulted(&self) -> Vec<(FaultRange, R)> {
        std::mem::take(&mut self.state.lock().faulted)
    }

    /// Stop accepting reads, wake all waiters, return every parked read
    pub fn shutdown(&self) -> Vec<R> {
        let parked = {
            let mut state = self.state.lock();
            state.shut_down = true;
            let pending = std::mem::take(&mut state.pending);
            let faulted = std::mem::take(&mut state.faulted);
            pending
                .into_iter()
                .chain(faulted)
                .map(|(_, read)| read)
                .collect()
        };
        self.reads_ready.notify_waiters();
        self.writes_ready.notify_waiters();
        parked
    }

    /// Check if shutdown has begun
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Current queue depths
    #[must_use]
    pub fn depths(&self) -> QueueDepths {
        let state = self.state.lock();
        QueueDepths {
            pending_reads: state.pending.len(),
            faulted_reads: state.faulted.len(),
            done_writes: state.done.len(),
        }
    }
}
