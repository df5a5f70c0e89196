//! NativeContext - the wrapped library's own main context.
//!
//! `begin` hooks are dispatched here rather than on the loop thread. The
//! context is a single named thread fed by a lock-free queue; producers push
//! and unpark, the thread drains and parks when idle.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, Thread, ThreadId};

use crossbeam_queue::SegQueue;

use crate::error::{BridgeError, Result};
use crate::queue::Work;

struct Shared {
    queue: SegQueue<Work>,
    closed: AtomicBool,
}

pub struct NativeContext {
    shared: Arc<Shared>,
    thread: Thread,
    handle: Option<JoinHandle<()>>,
}

impl NativeContext {
    pub fn new(thread_name: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            closed: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run(&worker))?;
        tracing::debug!(thread = thread_name, "native context started");
        Ok(Self {
            thread: handle.thread().clone(),
            shared,
            handle: Some(handle),
        })
    }

    /// Queue `work` on the native thread. Fails once the context is closed;
    /// the rejected closure is dropped on the caller's thread.
    pub fn schedule<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ContextClosed);
        }
        self.shared.queue.push(Box::new(work));
        self.thread.unpark();
        Ok(())
    }

    /// Run `work` on the native thread and wait for its value.
    pub fn perform<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_native_thread() {
            return Err(BridgeError::BlockingOnNativeThread);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.schedule(move || {
            let _ = tx.send(work());
        })?;
        // A dropped sender means the closure unwound before sending.
        rx.recv().map_err(|_| BridgeError::WorkPanicked)
    }

    pub fn is_native_thread(&self) -> bool {
        thread::current().id() == self.thread.id()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }
}

fn run(shared: &Shared) {
    loop {
        while let Some(work) = shared.queue.pop() {
            if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                tracing::error!("native work item panicked");
            }
        }
        if shared.closed.load(Ordering::Acquire) && shared.queue.is_empty() {
            break;
        }
        thread::park();
    }
    tracing::debug!("native context stopped");
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.thread.unpark();
        let Some(handle) = self.handle.take() else {
            return;
        };
        // The last owner can be released by a work item on the native thread
        // itself; joining there would never return.
        if self.is_native_thread() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("native context thread panicked");
        }
    }
}

impl std::fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeContext")
            .field("thread", &self.thread.name())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}
