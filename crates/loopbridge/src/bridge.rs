//! EventLoopBridge - the sanctioned path from any native thread to the loop thread.
//!
//! ```text
//!   native thread A ──┐                        ┌── HostLoop::run (loop thread)
//!   native thread B ──┼─ schedule ─► WorkQueue ┤     drain_pending()
//!   monitor thread  ──┘      │                 │     poller.wait(idle_timeout)
//!                            └── poller.notify ┘
//! ```
//!
//! `HostLoop` is pinned to the thread that created it and is the only type
//! that can drain the queue. `EventLoopBridge` is a cheap, `Send + Sync`
//! handle that any thread can use to schedule work or hold the loop alive.
//!
//! Dropping the `HostLoop` closes the queue. Work still queued is dropped
//! unrun on the loop thread, and work scheduled afterwards is dropped by
//! `schedule` itself.

use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use polling::{Events, Poller};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::queue::{WakeSource, WorkQueue};
use crate::sync::Arc;

// =============================================================================
// Wake source backed by the reactor's poller
// =============================================================================

struct PollerWake(std::sync::Arc<Poller>);

impl WakeSource for PollerWake {
    fn wake(&self) {
        if let Err(err) = self.0.notify() {
            tracing::warn!(%err, "failed to notify loop thread");
        }
    }
}

// =============================================================================
// EventLoopBridge
// =============================================================================

#[derive(Clone)]
pub struct EventLoopBridge {
    queue: Arc<WorkQueue>,
    loop_thread: ThreadId,
}

impl EventLoopBridge {
    /// Queue `work` to run on the loop thread. Never blocks.
    ///
    /// Once the host loop is gone `work` is dropped without running.
    pub fn schedule<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::trace!("schedule");
        self.queue.push(Box::new(work));
    }

    /// Run `work` on the loop thread and wait for its value.
    ///
    /// Holds a usage reference while waiting so the loop can't exit with the
    /// item still queued. Fails fast instead of deadlocking when called on
    /// the loop thread itself, and with `ContextClosed` once the host loop
    /// has been dropped.
    pub fn perform_blocking<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_loop_thread() {
            return Err(BridgeError::BlockingOnLoopThread);
        }

        let slot = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let out = std::sync::Arc::clone(&slot);

        self.increase_usage();
        let performed = WorkQueue::perform(&self.queue, Box::new(move || {
            let value = work();
            *out.lock() = Some(value);
        }));
        self.decrease_usage();
        performed?;

        let value = slot.lock().take();
        value.ok_or(BridgeError::WorkPanicked)
    }

    pub fn increase_usage(&self) {
        let usage = self.queue.increase_usage();
        tracing::trace!(usage, "usage increased");
    }

    pub fn decrease_usage(&self) {
        let usage = self.queue.decrease_usage();
        tracing::trace!(usage, "usage decreased");
    }

    pub fn usage(&self) -> usize {
        self.queue.usage()
    }

    pub fn is_armed(&self) -> bool {
        self.queue.is_armed()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    /// Whether the host loop has been dropped.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl std::fmt::Debug for EventLoopBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopBridge")
            .field("loop_thread", &self.loop_thread)
            .field("usage", &self.usage())
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// HostLoop - the loop thread side
// =============================================================================

/// The host's single loop thread.
///
/// Create it on the thread that will run host code; it is deliberately
/// `!Send`.
pub struct HostLoop {
    bridge: EventLoopBridge,
    poller: std::sync::Arc<Poller>,
    events: Events,
    config: BridgeConfig,
    _not_send: PhantomData<*const ()>,
}

impl HostLoop {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let poller = std::sync::Arc::new(Poller::new()?);
        let queue = Arc::new(WorkQueue::new(PollerWake(std::sync::Arc::clone(&poller))));
        let bridge = EventLoopBridge {
            queue,
            loop_thread: thread::current().id(),
        };
        tracing::debug!(loop_thread = ?bridge.loop_thread, "host loop created");
        Ok(Self {
            bridge,
            poller,
            events: Events::new(),
            config,
            _not_send: PhantomData,
        })
    }

    pub fn bridge(&self) -> EventLoopBridge {
        self.bridge.clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Execute everything queued so far, plus anything those items queue.
    pub fn drain_pending(&self) -> usize {
        self.bridge.queue.drain()
    }

    /// One drain pass. Returns whether the loop is still kept alive.
    pub fn run_once(&self) -> bool {
        self.drain_pending();
        self.bridge.queue.keeps_alive()
    }

    /// Run until no usage is held and nothing is queued.
    /// Returns the number of work items executed.
    pub fn run(&mut self) -> Result<usize> {
        let mut executed = 0;
        loop {
            executed += self.drain_pending();
            if !self.bridge.queue.keeps_alive() {
                break;
            }
            self.wait(self.config.idle_timeout)?;
        }
        tracing::debug!(executed, "host loop idle");
        Ok(executed)
    }

    /// Like [`run`](Self::run) but gives up at `limit`.
    /// Returns `true` if the loop went idle, `false` on timeout.
    pub fn run_for(&mut self, limit: Duration) -> Result<bool> {
        let deadline = Instant::now() + limit;
        loop {
            self.drain_pending();
            if !self.bridge.queue.keeps_alive() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(usage = self.bridge.usage(), "host loop run_for timed out");
                return Ok(false);
            }
            self.wait(self.config.idle_timeout.min(deadline - now))?;
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<()> {
        self.events.clear();
        self.poller.wait(&mut self.events, Some(timeout))?;
        Ok(())
    }
}

impl Drop for HostLoop {
    fn drop(&mut self) {
        let stranded = self.bridge.queue.close();
        if !stranded.is_empty() {
            tracing::warn!(items = stranded.len(), "host loop dropped with work still queued");
        }
        // Dropped here, on the loop thread, so unsettled promises reject in
        // place instead of scheduling onto the closed queue.
        drop(stranded);
        tracing::debug!(usage = self.bridge.usage(), "host loop closed");
    }
}
