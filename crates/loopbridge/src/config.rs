//! Bridge configuration with environment overrides.

use std::time::Duration;

use crate::error::{BridgeError, Result};

pub const ENV_IDLE_TIMEOUT_MS: &str = "LOOPBRIDGE_IDLE_TIMEOUT_MS";
pub const ENV_MONITOR_INTERVAL_MS: &str = "LOOPBRIDGE_MONITOR_INTERVAL_MS";
pub const ENV_NATIVE_THREAD: &str = "LOOPBRIDGE_NATIVE_THREAD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Upper bound for a single wait on the wake source.
    pub idle_timeout: Duration,
    /// Poll period used by monitors that don't specify their own.
    pub monitor_interval: Duration,
    /// Name of the thread that runs the wrapped library's context.
    pub native_thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(100),
            native_thread_name: "loopbridge-native".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Defaults, overridden by any `LOOPBRIDGE_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = lookup(ENV_IDLE_TIMEOUT_MS) {
            config.idle_timeout = parse_millis(ENV_IDLE_TIMEOUT_MS, &ms)?;
        }
        if let Some(ms) = lookup(ENV_MONITOR_INTERVAL_MS) {
            config.monitor_interval = parse_millis(ENV_MONITOR_INTERVAL_MS, &ms)?;
        }
        if let Some(name) = lookup(ENV_NATIVE_THREAD) {
            if name.trim().is_empty() {
                return Err(BridgeError::Config(format!("{ENV_NATIVE_THREAD} is empty")));
            }
            config.native_thread_name = name;
        }
        Ok(config)
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_native_thread_name(mut self, name: impl Into<String>) -> Self {
        self.native_thread_name = name.into();
        self
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    let ms: u64 = raw
        .trim()
        .parse()
        .map_err(|_| BridgeError::Config(format!("{key}={raw:?} is not a millisecond count")))?;
    if ms == 0 {
        return Err(BridgeError::Config(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_millis(ms))
}
