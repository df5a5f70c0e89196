//! Host-side promise/resolver pair.
//!
//! A `Deferred` is the resolver half. It is settled exactly once, on the loop
//! thread, by consuming it. A `Promise` is the single consumer: its value is
//! either taken directly or delivered to one `on_settled` callback.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::EventLoopBridge;
use crate::error::{BridgeError, Result};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum State<T> {
    Pending(Option<Callback<T>>),
    Settled(Result<T>),
    Consumed,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// Create a linked resolver/promise pair bound to `bridge`'s loop thread.
pub(crate) fn pair<T: Send + 'static>(bridge: &EventLoopBridge) -> (Deferred<T>, Promise<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(None)),
    });
    (
        Deferred {
            shared: Some(Arc::clone(&shared)),
            bridge: bridge.clone(),
        },
        Promise {
            shared,
            bridge: bridge.clone(),
        },
    )
}

// =============================================================================
// Deferred
// =============================================================================

pub struct Deferred<T: Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
    bridge: EventLoopBridge,
}

impl<T: Send + 'static> Deferred<T> {
    pub(crate) fn settle(mut self, result: Result<T>) {
        debug_assert!(self.bridge.is_loop_thread(), "promise settled off the loop thread");
        if let Some(shared) = self.shared.take() {
            settle(&shared, result);
        }
    }
}

impl<T: Send + 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        tracing::warn!("deferred dropped without settling");
        if self.bridge.is_loop_thread() {
            settle(&shared, Err(BridgeError::ContextClosed));
        } else {
            self.bridge
                .schedule(move || settle(&shared, Err(BridgeError::ContextClosed)));
        }
    }
}

fn settle<T>(shared: &Shared<T>, result: Result<T>) {
    let callback = {
        let mut state = shared.state.lock();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Pending(Some(callback)) => callback,
            State::Pending(None) => {
                *state = State::Settled(result);
                return;
            }
            done => {
                *state = done;
                tracing::error!("promise settled twice");
                return;
            }
        }
    };
    callback(result);
}

// =============================================================================
// Promise
// =============================================================================

pub struct Promise<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    bridge: EventLoopBridge,
}

impl<T: Send + 'static> Promise<T> {
    pub fn is_settled(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending(_))
    }

    /// Take the outcome if the promise has settled and nobody took it yet.
    pub fn take(&self) -> Option<Result<T>> {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Settled(result) => Some(result),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Deliver the outcome to `f` on the loop thread, immediately if the
    /// promise has already settled and this is the loop thread.
    pub fn on_settled<F>(self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let ready = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut *state, State::Consumed) {
                State::Pending(_) => {
                    *state = State::Pending(Some(Box::new(f)));
                    return;
                }
                State::Settled(result) => result,
                State::Consumed => {
                    tracing::warn!("on_settled after the outcome was taken");
                    return;
                }
            }
        };
        if self.bridge.is_loop_thread() {
            f(ready);
        } else {
            self.bridge.schedule(move || f(ready));
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::bridge::HostLoop;
    use crate::config::BridgeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn host() -> HostLoop {
        HostLoop::new(BridgeConfig::default()).unwrap()
    }

    #[test]
    fn settled_value_can_be_taken_once() {
        let host = host();
        let (deferred, promise) = pair::<u32>(&host.bridge());
        assert!(!promise.is_settled());
        assert!(promise.take().is_none());
        deferred.settle(Ok(5));
        assert!(promise.is_settled());
        assert_eq!(promise.take().unwrap().unwrap(), 5);
        assert!(promise.take().is_none());
    }

    #[test]
    fn callback_registered_before_settle_runs_at_settle() {
        let host = host();
        let hits = Arc::new(AtomicUsize::new(0));
        let (deferred, promise) = pair::<&'static str>(&host.bridge());
        let h = hits.clone();
        promise.on_settled(move |result| {
            assert_eq!(result.unwrap(), "done");
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        deferred.settle(Ok("done"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_after_settle_runs_immediately_on_loop_thread() {
        let host = host();
        let (deferred, promise) = pair::<u8>(&host.bridge());
        deferred.settle(Err(BridgeError::BadArgument("nope".into())));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        promise.on_settled(move |result| {
            assert!(matches!(result, Err(BridgeError::BadArgument(_))));
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_deferred_rejects() {
        let host = host();
        let (deferred, promise) = pair::<()>(&host.bridge());
        drop(deferred);
        assert!(matches!(promise.take(), Some(Err(BridgeError::ContextClosed))));
    }

    #[test]
    fn deferred_dropped_off_loop_thread_rejects_through_bridge() {
        let host = host();
        let (deferred, promise) = pair::<()>(&host.bridge());
        std::thread::spawn(move || drop(deferred)).join().unwrap();
        assert!(!promise.is_settled());
        host.drain_pending();
        assert!(matches!(promise.take(), Some(Err(BridgeError::ContextClosed))));
    }
}
