//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or command handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("invalid frame length: {0} bytes is shorter than a header")]
    InvalidLength(u32),

    #[error("invalid header type: {0}")]
    InvalidHeaderType(u8),

    #[error("truncated header: need {needed} bytes, {available} available")]
    TruncatedHeader { needed: usize, available: usize },

    #[error("invalid UTF-8 in header error text")]
    InvalidUtf8,

    #[error("unknown command type: {0}")]
    UnknownCommandType(u32),

    #[error("malformed body for command type {command_type}: {reason}")]
    MalformedBody { command_type: u32, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Creates a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        ProtocolError::Validation(reason.into())
    }

    /// Returns whether this error comes from framing or header parsing,
    /// as opposed to the content of an otherwise well-framed command.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::InvalidLength(_)
                | ProtocolError::InvalidHeaderType(_)
                | ProtocolError::TruncatedHeader { .. }
                | ProtocolError::InvalidUtf8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InvalidHeaderType(7);
        assert!(err.to_string().contains('7'));

        let err = ProtocolError::UnknownCommandType(4242);
        assert!(err.to_string().contains("4242"));

        let err = ProtocolError::TruncatedHeader {
            needed: 19,
            available: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("19") && msg.contains('3'));

        let err = ProtocolError::validation("body too short");
        assert!(err.to_string().contains("body too short"));
    }

    #[test]
    fn test_framing_classification() {
        assert!(ProtocolError::InvalidLength(2).is_framing());
        assert!(ProtocolError::InvalidHeaderType(9).is_framing());
        assert!(!ProtocolError::UnknownCommandType(1).is_framing());
        assert!(!ProtocolError::validation("x").is_framing());
    }
}
