//! WorkQueue - the only state shared between native threads and the loop thread.
//!
//! One mutex guards the pending FIFO, the "wake pending" flag, the closed
//! flag and the usage counter; one condition variable serves blocking
//! performers.
//!
//! # Invariants
//!
//! - `push` and `take_batch` are the only operations that touch the FIFO.
//! - The lock is NEVER held while a work item runs. `drain` takes the whole
//!   batch under the lock, releases it, runs the batch, then re-locks.
//! - Only the first push after a drain signals the wake source; later pushes
//!   ride on the same wakeup.
//! - The usage counter never goes below zero. Arm/disarm is derived from the
//!   counter under the lock, so concurrent increments and decrements can't
//!   leave the wake source in a state that disagrees with the count.
//! - Once closed, the queue holds nothing. `close` hands back the pending
//!   batch and later pushes drop their item on the spot, so items that own
//!   a handle to the queue can't keep it alive in a cycle.

use std::collections::VecDeque;

use crate::error::{BridgeError, Result};
use crate::sync::{lock, wait, Arc, AtomicU8, Condvar, Mutex, Ordering};

/// A closure to run on the loop thread.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Cross-thread wake handle for the loop thread.
///
/// `wake` may be called from any thread and must make the loop thread run a
/// drain pass eventually, even if it is currently idle.
pub trait WakeSource: Send + Sync + 'static {
    fn wake(&self);
}

struct QueueState {
    pending: VecDeque<Work>,
    wake_pending: bool,
    closed: bool,
    usage: usize,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    waker: Box<dyn WakeSource>,
}

impl WorkQueue {
    pub fn new(waker: impl WakeSource) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                wake_pending: false,
                closed: false,
                usage: 0,
            }),
            cond: Condvar::new(),
            waker: Box::new(waker),
        }
    }

    /// Append `work` and signal the wake source if no drain is already due.
    ///
    /// Returns `false` if the queue is closed; `work` has then been dropped
    /// without running.
    pub fn push(&self, work: Work) -> bool {
        let signal = {
            let mut state = lock(&self.state);
            if state.closed {
                None
            } else {
                state.pending.push_back(work);
                Some(!std::mem::replace(&mut state.wake_pending, true))
            }
        };
        match signal {
            Some(true) => self.waker.wake(),
            Some(false) => {}
            None => {
                tracing::debug!("push to a closed queue, dropping work item");
                return false;
            }
        }
        true
    }

    /// Stop accepting work and hand back everything still queued.
    ///
    /// The caller drops or runs the batch outside the lock. Blocked
    /// performers whose items are in the batch are released when those
    /// items are dropped.
    pub fn close(&self) -> VecDeque<Work> {
        let batch = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.wake_pending = false;
            std::mem::take(&mut state.pending)
        };
        tracing::debug!(stranded = batch.len(), "work queue closed");
        batch
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Pop the entire current batch, or `None` if nothing is queued.
    pub fn take_batch(&self) -> Option<VecDeque<Work>> {
        let mut state = lock(&self.state);
        state.wake_pending = false;
        if state.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut state.pending))
        }
    }

    /// Run every queued item in submission order, including items queued by
    /// the items themselves. Returns the number of items executed.
    pub fn drain(&self) -> usize {
        let mut executed = 0;
        while let Some(batch) = self.take_batch() {
            tracing::trace!(items = batch.len(), "drain batch");
            for work in batch {
                work();
                executed += 1;
            }
        }
        executed
    }

    /// Push `work` and block until it has run on the draining thread.
    ///
    /// The outcome is recorded under the queue lock by a guard that also
    /// fires during unwinding or when the item is dropped unrun, so neither
    /// a panicking item nor a closing queue can strand the waiter. Never
    /// call this from the thread that drains the queue.
    ///
    /// Fails with `ContextClosed` if the queue closed before the item ran
    /// and with `WorkPanicked` if the item unwound.
    pub fn perform(queue: &Arc<WorkQueue>, work: Work) -> Result<()> {
        let outcome = Arc::new(AtomicU8::new(PERFORM_PENDING));
        let guard = DoneGuard {
            queue: Arc::clone(queue),
            outcome: Arc::clone(&outcome),
            ran: false,
        };
        if !queue.push(Box::new(move || {
            let mut guard = guard;
            work();
            guard.ran = true;
        })) {
            return Err(BridgeError::ContextClosed);
        }

        let mut state = lock(&queue.state);
        loop {
            match outcome.load(Ordering::Relaxed) {
                PERFORM_PENDING => state = wait(&queue.cond, state),
                PERFORM_RAN => return Ok(()),
                _ if state.closed => return Err(BridgeError::ContextClosed),
                _ => return Err(BridgeError::WorkPanicked),
            }
        }
    }

    /// Count one more outstanding user of the loop. Returns the new count.
    pub fn increase_usage(&self) -> usize {
        let mut state = lock(&self.state);
        state.usage += 1;
        if state.usage == 1 {
            tracing::debug!("wake source armed");
        }
        state.usage
    }

    /// Release one user. Returns the new count; an unmatched release is
    /// reported and ignored.
    pub fn decrease_usage(&self) -> usize {
        let remaining = {
            let mut state = lock(&self.state);
            if state.usage == 0 {
                tracing::error!("usage counter released more often than acquired");
                return 0;
            }
            state.usage -= 1;
            state.usage
        };
        if remaining == 0 {
            tracing::debug!("wake source disarmed");
            // Let an idle loop re-evaluate whether it may exit.
            self.waker.wake();
        }
        remaining
    }

    pub fn usage(&self) -> usize {
        lock(&self.state).usage
    }

    /// Whether the usage counter currently holds the wake source armed.
    pub fn is_armed(&self) -> bool {
        self.usage() > 0
    }

    pub fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Whether the loop must keep running: work is queued or users remain.
    pub fn keeps_alive(&self) -> bool {
        let state = lock(&self.state);
        state.usage > 0 || !state.pending.is_empty()
    }
}

const PERFORM_PENDING: u8 = 0;
const PERFORM_RAN: u8 = 1;
const PERFORM_ABORTED: u8 = 2;

struct DoneGuard {
    queue: Arc<WorkQueue>,
    outcome: Arc<AtomicU8>,
    ran: bool,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _state = lock(&self.queue.state);
        let outcome = if self.ran { PERFORM_RAN } else { PERFORM_ABORTED };
        self.outcome.store(outcome, Ordering::Relaxed);
        self.queue.cond.notify_all();
    }
}
