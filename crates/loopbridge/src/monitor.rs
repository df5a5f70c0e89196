//! ResourceMonitor - one-shot liveness watch over a native object.
//!
//! A background thread polls `predicate` against the native object every
//! `interval`. The first time it returns `true` the monitor stops polling and
//! delivers `signal` to the host callback on the loop thread.
//!
//! The poll thread only holds a `Weak` reference, so a monitor never keeps
//! its resource alive. Whoever moves the monitor out of `Polling` (the
//! delivery, `disable`, or the poll thread noticing the resource is gone)
//! releases the usage reference taken by `enable`.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bridge::EventLoopBridge;
use crate::error::{BridgeError, Result};
use crate::resource::{ManagedResource, NativeObject};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync + 'static>;

enum Phase {
    Idle,
    Polling { generation: u64, bridge: EventLoopBridge },
    Fired,
}

struct Shared {
    phase: Mutex<Phase>,
    next_generation: Mutex<u64>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        matches!(&*self.phase.lock(), Phase::Polling { generation: g, .. } if *g == generation)
    }

    /// Leave `Polling` for `to` if `generation` is still current, releasing
    /// its usage reference.
    fn finish(&self, generation: u64, to: Phase) -> bool {
        let bridge = {
            let mut phase = self.phase.lock();
            match &*phase {
                Phase::Polling { generation: g, .. } if *g == generation => {}
                _ => return false,
            }
            match std::mem::replace(&mut *phase, to) {
                Phase::Polling { bridge, .. } => bridge,
                _ => return false,
            }
        };
        bridge.decrease_usage();
        true
    }
}

pub struct ResourceMonitor<T: NativeObject> {
    signal: Arc<str>,
    predicate: Predicate<T>,
    interval: Option<Duration>,
    shared: Arc<Shared>,
}

impl<T: NativeObject> ResourceMonitor<T> {
    /// `interval` of `None` uses the runtime's configured monitor interval.
    pub fn new<P>(signal: &str, predicate: P, interval: Option<Duration>) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            signal: Arc::from(signal),
            predicate: Arc::new(predicate),
            interval,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                next_generation: Mutex::new(0),
            }),
        }
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Start polling `resource`. A no-op while already polling or after the
    /// monitor has fired. Loop thread only.
    pub fn enable<F>(&self, resource: &Arc<ManagedResource<T>>, on_fire: F) -> Result<()>
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let bridge = resource.runtime().bridge().clone();
        if !bridge.is_loop_thread() {
            return Err(BridgeError::NotOnLoopThread);
        }
        let interval = self
            .interval
            .unwrap_or(resource.runtime().config().monitor_interval);

        let generation = {
            let mut phase = self.shared.phase.lock();
            if !matches!(*phase, Phase::Idle) {
                return Ok(());
            }
            let mut next = self.shared.next_generation.lock();
            *next += 1;
            *phase = Phase::Polling { generation: *next, bridge: bridge.clone() };
            *next
        };
        bridge.increase_usage();

        let poll = Poll {
            shared: Arc::clone(&self.shared),
            generation,
            resource: Arc::downgrade(resource),
            predicate: Arc::clone(&self.predicate),
            signal: Arc::clone(&self.signal),
            interval,
            bridge,
        };
        let spawned = thread::Builder::new()
            .name(format!("monitor-{}", self.signal))
            .spawn(move || poll.run(on_fire));
        if let Err(err) = spawned {
            self.shared.finish(generation, Phase::Idle);
            return Err(err.into());
        }
        tracing::debug!(signal = %self.signal, ?interval, "monitor enabled");
        Ok(())
    }

    /// Stop polling. Idempotent; a monitor that already fired stays fired.
    pub fn disable(&self) {
        let generation = match &*self.shared.phase.lock() {
            Phase::Polling { generation, .. } => *generation,
            _ => return,
        };
        if self.shared.finish(generation, Phase::Idle) {
            tracing::debug!(signal = %self.signal, "monitor disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(*self.shared.phase.lock(), Phase::Polling { .. })
    }

    pub fn has_fired(&self) -> bool {
        matches!(*self.shared.phase.lock(), Phase::Fired)
    }
}

impl<T: NativeObject> Drop for ResourceMonitor<T> {
    fn drop(&mut self) {
        self.disable();
    }
}

struct Poll<T: NativeObject> {
    shared: Arc<Shared>,
    generation: u64,
    resource: Weak<ManagedResource<T>>,
    predicate: Predicate<T>,
    signal: Arc<str>,
    interval: Duration,
    bridge: EventLoopBridge,
}

impl<T: NativeObject> Poll<T> {
    fn run<F>(self, on_fire: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        loop {
            thread::sleep(self.interval);
            if !self.shared.is_current(self.generation) {
                return;
            }
            let flipped = match self.resource.upgrade() {
                Some(resource) => (self.predicate)(resource.native()),
                None => {
                    if self.shared.finish(self.generation, Phase::Idle) {
                        tracing::debug!(signal = %self.signal, "monitored resource released");
                    }
                    return;
                }
            };
            if flipped {
                break;
            }
            tracing::trace!(signal = %self.signal, "monitor poll");
        }

        let Poll { shared, generation, resource, signal, bridge, .. } = self;
        bridge.schedule(move || {
            // Re-check on the loop thread: disable or release may have won.
            // The upgraded handle stays alive until `on_fire` returns.
            let held = resource.upgrade();
            let to = if held.is_some() { Phase::Fired } else { Phase::Idle };
            if !shared.finish(generation, to) {
                return;
            }
            if let Some(_resource) = held {
                tracing::debug!(signal = %signal, "monitor fired");
                on_fire(&*signal);
            }
        });
    }
}
