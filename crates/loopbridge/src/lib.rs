//! loopbridge - drive a multi-threaded, callback-driven native library from a
//! single-threaded host loop.
//!
//! ```text
//!   ┌────────────── loop thread ──────────────┐      ┌──── native threads ────┐
//!   │ HostLoop::run                           │      │ NativeContext          │
//!   │   drain_pending ◄── WorkQueue ◄─────────┼──────┤   AsyncCall::begin     │
//!   │   Promise / Deferred                    │      │   Ready::complete/end  │
//!   │   AsyncCall::result                     │      │ ResourceMonitor poll   │
//!   └─────────────────────────────────────────┘      └────────────────────────┘
//! ```
//!
//! - [`HostLoop`] / [`EventLoopBridge`]: the work queue, wake source and usage
//!   counter. The only way for another thread to run host-visible code.
//! - [`AsyncOperation`]: a native begin/end call observed as a [`Promise`].
//! - [`RuntimeRegistry`]: per-session typed metadata, constructors and JSON.
//! - [`ManagedResource`]: one native reference per wrapper.
//! - [`ResourceMonitor`]: one-shot liveness polling.

mod bridge;
mod config;
mod error;
mod monitor;
mod native;
mod operation;
mod promise;
// Exposed only to the loom model tests; `HostLoop` owns the drain otherwise.
#[cfg(loom)]
pub mod queue;
#[cfg(not(loom))]
mod queue;
mod registry;
mod resource;
mod sync;

pub use bridge::{EventLoopBridge, HostLoop};
pub use config::{BridgeConfig, ENV_IDLE_TIMEOUT_MS, ENV_MONITOR_INTERVAL_MS, ENV_NATIVE_THREAD};
pub use error::{BridgeError, NativeError, Result};
pub use monitor::ResourceMonitor;
pub use native::NativeContext;
pub use operation::{AsyncCall, AsyncOperation, OperationState, Ready};
pub use promise::Promise;
pub use registry::{Constructor, JsonCodec, RuntimeRegistry, SerdeJsonCodec};
pub use resource::{ManagedResource, NativeObject};
