//! Error types, error codes, and process-wide last-error storage.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::ConfigError;

// ── Error codes (C API) ─────────────────────────────────────────────────────

pub const SUCCESS: i32 = 0;
pub const ERROR_INVALID_PARAM: i32 = -1;
pub const ERROR_CONFIG: i32 = -2;
pub const ERROR_CAPTURE: i32 = -3;
pub const ERROR_SOCKET: i32 = -4;
pub const ERROR_WORKER: i32 = -5;
pub const ERROR_INTERNAL: i32 = -6;

// ── ProxyError enum ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Packet capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Failed to {action} listening socket: {source}")]
    Socket {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {name} worker: {source}")]
    Worker {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub(crate) fn socket(action: &'static str, source: std::io::Error) -> Self {
        ProxyError::Socket { action, source }
    }

    /// Map this error to its integer error code for the C API.
    pub fn code(&self) -> i32 {
        match self {
            ProxyError::Config(_) => ERROR_CONFIG,
            ProxyError::Capture(_) => ERROR_CAPTURE,
            ProxyError::Socket { .. } => ERROR_SOCKET,
            ProxyError::Worker { .. } => ERROR_WORKER,
            ProxyError::InvalidParam(_) => ERROR_INVALID_PARAM,
            ProxyError::Internal(_) => ERROR_INTERNAL,
        }
    }
}

// ── Last-error storage ──────────────────────────────────────────────────────

static LAST_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static LAST_ERROR_CODE: Lazy<Mutex<i32>> = Lazy::new(|| Mutex::new(SUCCESS));

/// Store a `ProxyError`, recording both the message and code.
pub fn set_proxy_error(err: &ProxyError) {
    *LAST_ERROR_CODE.lock() = err.code();
    *LAST_ERROR.lock() = Some(err.to_string());
}

/// Clear the stored error.
pub fn clear_error() {
    *LAST_ERROR.lock() = None;
    *LAST_ERROR_CODE.lock() = SUCCESS;
}

/// Take the last error message, leaving `None` behind.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.lock().take()
}

/// Return the last error code without clearing it.
pub fn last_error_code() -> i32 {
    *LAST_ERROR_CODE.lock()
}
