//! RuntimeRegistry - per-session runtime state shared by every wrapper.
//!
//! Holds the loop bridge, the wrapped library's context, a keyed table of
//! type metadata and the JSON codec captured when the session starts. It is
//! passed by `Arc` to every collaborator; there is no global instance.
//!
//! Table entries keep their `TypeId`, so a lookup with the wrong type misses
//! instead of handing back a reinterpreted pointer.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::bridge::{EventLoopBridge, HostLoop};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::native::NativeContext;
use crate::resource::{ManagedResource, NativeObject};

// =============================================================================
// JSON codec
// =============================================================================

/// The host's stringify/parse pair.
pub trait JsonCodec: Send + Sync + 'static {
    fn stringify(&self, value: &Value) -> Result<String>;
    fn parse(&self, text: &str) -> Result<Value>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerdeJsonCodec;

impl JsonCodec for SerdeJsonCodec {
    fn stringify(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn parse(&self, text: &str) -> Result<Value> {
        Ok(serde_json::from_str(text)?)
    }
}

// =============================================================================
// Registry
// =============================================================================

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Builds the host wrapper for a native object of type `T`.
pub struct Constructor<T: NativeObject, W> {
    build: Box<dyn Fn(Arc<ManagedResource<T>>) -> Result<W> + Send + Sync>,
}

impl<T: NativeObject, W> Constructor<T, W> {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(Arc<ManagedResource<T>>) -> Result<W> + Send + Sync + 'static,
    {
        Self { build: Box::new(build) }
    }
}

pub struct RuntimeRegistry {
    bridge: EventLoopBridge,
    native: NativeContext,
    config: BridgeConfig,
    data: RwLock<HashMap<String, Entry>>,
    codec: Box<dyn JsonCodec>,
}

impl RuntimeRegistry {
    pub fn new(host: &HostLoop) -> Result<Arc<Self>> {
        Self::with_codec(host, SerdeJsonCodec)
    }

    pub fn with_codec(host: &HostLoop, codec: impl JsonCodec) -> Result<Arc<Self>> {
        let config = host.config().clone();
        let native = NativeContext::new(&config.native_thread_name)?;
        tracing::debug!("runtime registry created");
        Ok(Arc::new(Self {
            bridge: host.bridge(),
            native,
            config,
            data: RwLock::new(HashMap::new()),
            codec: Box::new(codec),
        }))
    }

    pub fn bridge(&self) -> &EventLoopBridge {
        &self.bridge
    }

    pub fn native(&self) -> &NativeContext {
        &self.native
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Keyed data
    // -------------------------------------------------------------------------

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        let key = key.into();
        let type_name = std::any::type_name::<T>();
        tracing::trace!(%key, type_name, "registry set");
        self.data.write().insert(
            key,
            Entry {
                type_id: TypeId::of::<T>(),
                type_name,
                value,
            },
        );
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let data = self.data.read();
        let entry = data.get(key)?;
        if entry.type_id != TypeId::of::<T>() {
            tracing::debug!(
                key,
                stored = entry.type_name,
                requested = std::any::type_name::<T>(),
                "registry type mismatch"
            );
            return None;
        }
        Arc::clone(&entry.value).downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Constructors
    // -------------------------------------------------------------------------

    pub fn register_constructor<T, W, F>(&self, type_name: &str, build: F)
    where
        T: NativeObject,
        W: 'static,
        F: Fn(Arc<ManagedResource<T>>) -> Result<W> + Send + Sync + 'static,
    {
        self.set(ctor_key(type_name), Arc::new(Constructor::new(build)));
    }

    /// Materialise the host wrapper for `resource` with the constructor
    /// registered under `type_name`. Loop thread only.
    pub fn construct<T, W>(&self, type_name: &str, resource: Arc<ManagedResource<T>>) -> Result<W>
    where
        T: NativeObject,
        W: 'static,
    {
        if !self.bridge.is_loop_thread() {
            return Err(BridgeError::NotOnLoopThread);
        }
        let ctor = self
            .get::<Constructor<T, W>>(&ctor_key(type_name))
            .ok_or_else(|| BridgeError::BadArgument(format!("no constructor registered for {type_name}")))?;
        (ctor.build)(resource)
    }

    // -------------------------------------------------------------------------
    // JSON
    // -------------------------------------------------------------------------

    pub fn to_json(&self, value: &Value) -> Result<String> {
        self.codec.stringify(value)
    }

    pub fn from_json(&self, text: &str) -> Result<Value> {
        self.codec.parse(text)
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<String> {
        let value = serde_json::to_value(value)?;
        self.to_json(&value)
    }

    pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        let value = self.from_json(text)?;
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("entries", &self.len())
            .field("native", &self.native)
            .finish()
    }
}

fn ctor_key(type_name: &str) -> String {
    format!("{type_name}:ctor")
}
