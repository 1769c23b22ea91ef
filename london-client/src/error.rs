//! Client error types.

use std::fmt;
use thiserror::Error;

/// Transaction step an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Checking a connection out of the pool.
    Acquire,
    /// Writing the subscribe frame.
    Subscribe,
    /// Waiting for the status frame.
    Response,
    /// Writing the unsubscribe frame.
    Unsubscribe,
    /// Writing a set command.
    Command,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Acquire => write!(f, "acquire connection"),
            Step::Subscribe => write!(f, "write subscribe command"),
            Step::Response => write!(f, "read response"),
            Step::Unsubscribe => write!(f, "write unsubscribe command"),
            Step::Command => write!(f, "write command"),
        }
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] london_protocol::ProtocolError),

    #[error("unable to {step}: {source}")]
    Io {
        step: Step,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to {step}: deadline exceeded")]
    Timeout { step: Step },

    #[error("unable to {step}: cancelled")]
    Cancelled { step: Step },

    #[error("unable to {step}: wrote {written}/{expected} bytes")]
    ShortWrite {
        step: Step,
        written: usize,
        expected: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    pub(crate) fn io(step: Step, source: std::io::Error) -> Self {
        ClientError::Io { step, source }
    }

    /// Returns the step the error was raised in, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            ClientError::Io { step, .. }
            | ClientError::Timeout { step }
            | ClientError::Cancelled { step }
            | ClientError::ShortWrite { step, .. } => Some(*step),
            ClientError::Protocol(_) | ClientError::Config(_) => None,
        }
    }

    /// Returns whether retrying the operation might succeed.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io { .. } => true,
            ClientError::Timeout { .. } => true,
            ClientError::Cancelled { .. } => false,
            // Part of the command may already have reached the device
            ClientError::ShortWrite { .. } => false,
            ClientError::Protocol(_) => false,
            ClientError::Config(_) => false,
        }
    }
}
