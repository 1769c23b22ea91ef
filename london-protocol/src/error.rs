//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors raised while building, framing or parsing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An encoded frame still contains a literal marker byte.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProtocolError {
    /// Returns whether the error was caused by the caller rather than the device.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, ProtocolError::InvalidArgument(_))
    }
}
