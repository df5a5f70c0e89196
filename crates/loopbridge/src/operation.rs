//! AsyncOperation - one native begin/end call observed as a host promise.
//!
//! ```text
//!   loop thread            native context          any native thread       loop thread
//!   ───────────            ──────────────          ─────────────────       ───────────
//!   schedule()  ──────►    call.begin(target,  ──► ready.complete(r)  ──►  call.result(out)
//!   Created→Running           ready)                 call.end(r)            Running→Settled
//!   usage += 1                                                              deferred.settle
//!                                                                           usage -= 1
//! ```
//!
//! `begin` and `end` never see host state; `result` and the settlement always
//! run on the loop thread through the bridge.
//!
//! The usage reference taken by `schedule` is owned by a [`Settlement`]. It is
//! released exactly once, whether the settlement runs, unwinds, or is dropped
//! unrun because the host loop went away.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::bridge::EventLoopBridge;
use crate::error::{BridgeError, NativeError, Result};
use crate::promise::{self, Deferred, Promise};
use crate::registry::RuntimeRegistry;
use crate::resource::{ManagedResource, NativeObject};

/// Capability interface implemented once per native call site.
pub trait AsyncCall: Send + Sync + 'static {
    /// The native object the call targets.
    type Target: NativeObject;
    /// What the native completion callback hands back (the async result token).
    type Ready: Send + 'static;
    /// Native-side outcome extracted by `end`.
    type Output: Send + 'static;
    /// Host-side value the promise resolves with.
    type Value: Send + 'static;

    /// Issue the native call. Runs on the native context thread; `ready` must
    /// be completed exactly once, from any thread.
    fn begin(&self, target: &Self::Target, ready: Ready<Self::Ready>);

    /// Finish the native call. Runs on whichever thread completed `ready`.
    fn end(&self, target: &Self::Target, ready: Self::Ready) -> Result<Self::Output, NativeError>;

    /// Build the host value. Runs on the loop thread.
    fn result(&self, output: Self::Output, runtime: &Arc<RuntimeRegistry>) -> Result<Self::Value>;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Created,
    Running,
    Settled,
}

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const SETTLED: u8 = 2;

struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(CREATED))
    }

    fn start(&self) -> bool {
        self.0
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn settle(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, SETTLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn get(&self) -> OperationState {
        match self.0.load(Ordering::Acquire) {
            CREATED => OperationState::Created,
            RUNNING => OperationState::Running,
            _ => OperationState::Settled,
        }
    }
}

// =============================================================================
// Ready - the completion token handed to `begin`
// =============================================================================

enum Completion<R> {
    Ready(R),
    Failed(NativeError),
    Abandoned,
}

type Finish<R> = Box<dyn FnOnce(Completion<R>) + Send + 'static>;

/// Completion context for one native call.
///
/// Dropping it without completing rejects the promise, so a native callback
/// that never fires still releases the loop.
pub struct Ready<R: Send + 'static> {
    finish: Option<Finish<R>>,
}

impl<R: Send + 'static> Ready<R> {
    /// The native completion callback fired with `ready`.
    pub fn complete(mut self, ready: R) {
        if let Some(finish) = self.finish.take() {
            finish(Completion::Ready(ready));
        }
    }

    /// The call could not be started or failed before producing a token.
    pub fn fail(mut self, error: NativeError) {
        if let Some(finish) = self.finish.take() {
            finish(Completion::Failed(error));
        }
    }
}

impl<R: Send + 'static> Drop for Ready<R> {
    fn drop(&mut self) {
        if let Some(finish) = self.finish.take() {
            tracing::warn!("completion token dropped before the native call finished");
            finish(Completion::Abandoned);
        }
    }
}

// =============================================================================
// Settlement - the outstanding half of a running operation
// =============================================================================

struct Settlement<T: Send + 'static> {
    deferred: Option<Deferred<T>>,
    lifecycle: Arc<Lifecycle>,
    bridge: EventLoopBridge,
}

impl<T: Send + 'static> Settlement<T> {
    fn settle(mut self, result: Result<T>) {
        if let Some(deferred) = self.deferred.take() {
            if self.lifecycle.settle() {
                tracing::debug!(ok = result.is_ok(), "operation settled");
            }
            deferred.settle(result);
        }
    }
}

impl<T: Send + 'static> Drop for Settlement<T> {
    fn drop(&mut self) {
        if let Some(deferred) = self.deferred.take() {
            tracing::warn!("operation dropped before settling");
            self.lifecycle.settle();
            drop(deferred);
        }
        self.bridge.decrease_usage();
    }
}

fn end_guarded<C: AsyncCall>(call: &C, target: &C::Target, ready: C::Ready) -> Result<C::Output, NativeError> {
    panic::catch_unwind(AssertUnwindSafe(|| call.end(target, ready))).unwrap_or_else(|_| {
        tracing::error!(call = std::any::type_name::<C>(), "end hook panicked");
        Err(NativeError::msg("native completion panicked"))
    })
}

// =============================================================================
// AsyncOperation
// =============================================================================

pub struct AsyncOperation<C: AsyncCall> {
    call: Arc<C>,
    lifecycle: Arc<Lifecycle>,
    promise: Option<Promise<C::Value>>,
}

impl<C: AsyncCall> AsyncOperation<C> {
    /// `call` owns the request parameters for the whole lifecycle.
    pub fn new(call: C) -> Self {
        Self {
            call: Arc::new(call),
            lifecycle: Arc::new(Lifecycle::new()),
            promise: None,
        }
    }

    pub fn state(&self) -> OperationState {
        self.lifecycle.get()
    }

    /// Start the call against `target`. Loop thread only, at most once.
    /// Every failure after this returns `Ok` is reported through the promise.
    pub fn schedule(&mut self, target: &Arc<ManagedResource<C::Target>>) -> Result<()> {
        let runtime = Arc::clone(target.runtime());
        let bridge = runtime.bridge().clone();
        if !bridge.is_loop_thread() {
            return Err(BridgeError::NotOnLoopThread);
        }
        if !self.lifecycle.start() {
            return Err(BridgeError::AlreadyScheduled);
        }
        tracing::debug!(call = std::any::type_name::<C>(), "operation running");

        let (deferred, handle) = promise::pair(&bridge);
        self.promise = Some(handle);
        bridge.increase_usage();
        let settlement = Settlement {
            deferred: Some(deferred),
            lifecycle: Arc::clone(&self.lifecycle),
            bridge: bridge.clone(),
        };

        let finish: Finish<C::Ready> = {
            let call = Arc::clone(&self.call);
            let target = Arc::clone(target);
            Box::new(move |completion| {
                let outcome = match completion {
                    Completion::Ready(ready) => end_guarded(&*call, target.native(), ready),
                    Completion::Failed(error) => Err(error),
                    Completion::Abandoned => Err(NativeError::msg("operation abandoned")),
                };
                bridge.schedule(move || {
                    let settled = match outcome {
                        Ok(output) => call.result(output, &runtime),
                        Err(error) => Err(error.into()),
                    };
                    drop(target);
                    settlement.settle(settled);
                });
            })
        };
        let ready = Ready { finish: Some(finish) };

        let call = Arc::clone(&self.call);
        let begin_target = Arc::clone(target);
        let dispatched = target
            .runtime()
            .native()
            .schedule(move || call.begin(begin_target.native(), ready));
        if let Err(err) = dispatched {
            // The dropped token has already queued the rejection.
            tracing::warn!(%err, "could not dispatch native call");
        }
        Ok(())
    }

    /// Take the promise created by [`schedule`](Self::schedule).
    pub fn promise(&mut self) -> Option<Promise<C::Value>> {
        self.promise.take()
    }
}

impl<C: AsyncCall> std::fmt::Debug for AsyncOperation<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("call", &std::any::type_name::<C>())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::bridge::HostLoop;
    use crate::config::BridgeConfig;
    use std::ptr::NonNull;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Handle {
        refs: AtomicUsize,
    }

    unsafe impl NativeObject for Handle {
        unsafe fn retain(ptr: NonNull<Self>) {
            ptr.as_ref().refs.fetch_add(1, Ordering::SeqCst);
        }
        unsafe fn release(ptr: NonNull<Self>) {
            ptr.as_ref().refs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Completes inline on the native context with `value`, or fails.
    struct Echo {
        value: Result<u32, NativeError>,
    }

    impl AsyncCall for Echo {
        type Target = Handle;
        type Ready = Result<u32, NativeError>;
        type Output = u32;
        type Value = String;

        fn begin(&self, _target: &Handle, ready: Ready<Self::Ready>) {
            ready.complete(self.value.clone());
        }

        fn end(&self, _target: &Handle, ready: Self::Ready) -> Result<u32, NativeError> {
            ready
        }

        fn result(&self, output: u32, _runtime: &Arc<RuntimeRegistry>) -> Result<String> {
            Ok(format!("#{output}"))
        }
    }

    /// Never completes its token.
    struct Forgetful;

    impl AsyncCall for Forgetful {
        type Target = Handle;
        type Ready = ();
        type Output = ();
        type Value = ();

        fn begin(&self, _target: &Handle, ready: Ready<()>) {
            drop(ready);
        }

        fn end(&self, _target: &Handle, _ready: ()) -> Result<(), NativeError> {
            Ok(())
        }

        fn result(&self, _output: (), _runtime: &Arc<RuntimeRegistry>) -> Result<()> {
            Ok(())
        }
    }

    /// Completes on a plain thread, then unwinds inside `end`.
    struct PanickingEnd;

    impl AsyncCall for PanickingEnd {
        type Target = Handle;
        type Ready = ();
        type Output = ();
        type Value = ();

        fn begin(&self, _target: &Handle, ready: Ready<()>) {
            std::thread::spawn(move || ready.complete(()));
        }

        fn end(&self, _target: &Handle, _ready: ()) -> Result<(), NativeError> {
            panic!("end hook failed");
        }

        fn result(&self, _output: (), _runtime: &Arc<RuntimeRegistry>) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (HostLoop, Arc<ManagedResource<Handle>>, &'static Handle) {
        let host = HostLoop::new(BridgeConfig::default().with_idle_timeout(Duration::from_millis(5))).unwrap();
        let runtime = RuntimeRegistry::new(&host).unwrap();
        let handle = Box::new(Handle { refs: AtomicUsize::new(1) });
        let target = unsafe { ManagedResource::retain(&runtime, NonNull::from(&*handle)) };
        (host, target, Box::leak(handle))
    }

    #[test]
    fn resolves_through_result_hook() {
        let (mut host, target, _handle) = setup();
        let mut op = AsyncOperation::new(Echo { value: Ok(7) });
        assert_eq!(op.state(), OperationState::Created);
        op.schedule(&target).unwrap();
        assert_eq!(op.state(), OperationState::Running);
        let promise = op.promise().unwrap();

        assert!(host.run_for(Duration::from_secs(5)).unwrap());
        assert_eq!(op.state(), OperationState::Settled);
        assert_eq!(promise.take().unwrap().unwrap(), "#7");
        assert_eq!(host.bridge().usage(), 0);
    }

    #[test]
    fn native_failure_rejects_with_operation_failed() {
        let (mut host, target, _handle) = setup();
        let mut op = AsyncOperation::new(Echo { value: Err(NativeError::new(2, "unable to attach")) });
        op.schedule(&target).unwrap();
        let promise = op.promise().unwrap();
        assert!(host.run_for(Duration::from_secs(5)).unwrap());
        let err = promise.take().unwrap().unwrap_err();
        assert_eq!(err.native_message(), Some("unable to attach"));
        assert_eq!(err.to_string(), "operation failed: unable to attach");
    }

    #[test]
    fn scheduling_twice_is_rejected() {
        let (mut host, target, _handle) = setup();
        let mut op = AsyncOperation::new(Echo { value: Ok(1) });
        op.schedule(&target).unwrap();
        assert!(matches!(op.schedule(&target), Err(BridgeError::AlreadyScheduled)));
        assert!(host.run_for(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn scheduling_off_loop_thread_is_rejected() {
        let (_host, target, _handle) = setup();
        let result = std::thread::spawn(move || {
            let mut op = AsyncOperation::new(Echo { value: Ok(1) });
            let result = op.schedule(&target);
            (result, op.state())
        })
        .join()
        .unwrap();
        assert!(matches!(result.0, Err(BridgeError::NotOnLoopThread)));
        assert_eq!(result.1, OperationState::Created);
    }

    #[test]
    fn abandoned_token_rejects_and_releases_usage() {
        let (mut host, target, handle) = setup();
        let mut op = AsyncOperation::new(Forgetful);
        op.schedule(&target).unwrap();
        let promise = op.promise().unwrap();
        assert!(host.run_for(Duration::from_secs(5)).unwrap());
        let err = promise.take().unwrap().unwrap_err();
        assert_eq!(err.native_message(), Some("operation abandoned"));
        assert_eq!(host.bridge().usage(), 0);

        // Let the native thread release the reference its begin closure held.
        target.runtime().native().perform(|| ()).unwrap();
        drop(target);
        assert_eq!(handle.refs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_end_rejects_and_releases_usage() {
        let (mut host, target, _handle) = setup();
        let mut op = AsyncOperation::new(PanickingEnd);
        op.schedule(&target).unwrap();
        let promise = op.promise().unwrap();

        assert!(host.run_for(Duration::from_secs(5)).unwrap());
        assert_eq!(op.state(), OperationState::Settled);
        let err = promise.take().unwrap().unwrap_err();
        assert_eq!(err.native_message(), Some("native completion panicked"));
        assert_eq!(host.bridge().usage(), 0);
    }

    #[test]
    fn settlement_dropped_with_host_releases_target() {
        let (host, target, handle) = setup();
        let mut op = AsyncOperation::new(Echo { value: Ok(3) });
        op.schedule(&target).unwrap();
        let promise = op.promise().unwrap();

        // Wait for the completion to be queued, then tear down without draining.
        let bridge = host.bridge();
        while bridge.pending() == 0 {
            std::thread::yield_now();
        }
        target.runtime().native().perform(|| ()).unwrap();
        drop(target);
        drop(host);

        assert!(matches!(promise.take(), Some(Err(BridgeError::ContextClosed))));
        assert_eq!(op.state(), OperationState::Settled);
        assert_eq!(bridge.usage(), 0);
        assert_eq!(handle.refs.load(Ordering::SeqCst), 1);
    }
}
