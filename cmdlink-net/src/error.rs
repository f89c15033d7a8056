//! Engine error types.

use cmdlink_protocol::ProtocolError;
use std::sync::Arc;
use thiserror::Error;

/// Engine errors.
///
/// Cloneable so a single failure can be stored in a resolved promise and
/// handed to every listener.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(Arc<ProtocolError>),

    #[error("request {command_id} timed out after {timeout_ms}ms")]
    Timeout { command_id: u32, timeout_ms: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("too many requests: {max} already in flight")]
    TooManyRequests { max: usize },

    #[error("service not running")]
    NotRunning,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("remote error (status {status}): {message}")]
    Remote { status: i32, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(Arc::new(e))
    }
}

impl From<ProtocolError> for NetError {
    fn from(e: ProtocolError) -> Self {
        NetError::Protocol(Arc::new(e))
    }
}

impl NetError {
    /// Returns whether retrying the request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetError::Io(_)
                | NetError::Timeout { .. }
                | NetError::ConnectionClosed
                | NetError::TooManyRequests { .. }
        )
    }

    /// Returns whether this error was produced locally by a request deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout { .. })
    }
}
