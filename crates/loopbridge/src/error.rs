//! Error taxonomy shared by every bridge component.

use std::fmt;

/// Failure reported by the wrapped library through an `end` hook.
///
/// This is the Rust side of the native `error` out-parameter: a numeric code
/// (domain specific, `0` when the library gives none) and a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// A failure with no meaningful native code.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            f.write_str(&self.message)
        } else {
            write!(f, "{} (code {})", self.message, self.code)
        }
    }
}

impl std::error::Error for NativeError {}

/// Errors surfaced by the bridge to host code.
///
/// `BadArgument` and the thread-affinity variants are returned synchronously
/// to the immediate caller. Everything that happens after an operation is
/// scheduled reaches the host only as a rejected promise.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The wrapped async call reported failure.
    #[error("operation failed: {message}")]
    NativeCall { code: i32, message: String },

    /// The caller supplied a malformed request.
    #[error("bad argument, {0}")]
    BadArgument(String),

    /// The JSON codec rejected a value or a document.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A loop-thread-only call was made from another thread.
    #[error("must be called on the loop thread")]
    NotOnLoopThread,

    /// `perform_blocking` was called on the loop thread, which would deadlock.
    #[error("perform_blocking called on the loop thread")]
    BlockingOnLoopThread,

    /// `NativeContext::perform` was called on the native context thread.
    #[error("perform called on the native context thread")]
    BlockingOnNativeThread,

    /// An operation was scheduled a second time.
    #[error("operation already scheduled")]
    AlreadyScheduled,

    /// A blocking work item panicked before producing its value.
    #[error("work item panicked")]
    WorkPanicked,

    /// The target context has shut down and no longer accepts work.
    #[error("context closed")]
    ContextClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// The native message carried by a `NativeCall` failure.
    pub fn native_message(&self) -> Option<&str> {
        match self {
            Self::NativeCall { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<NativeError> for BridgeError {
    fn from(err: NativeError) -> Self {
        Self::NativeCall { code: err.code, message: err.message }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
