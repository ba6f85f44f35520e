// Error types for the sandbox bridge

use thiserror::Error;

use crate::bus::ChannelClosed;
use crate::shared::SharedBufferError;

/// Main sandbox error type
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Context creation failed: {0}")]
    ContextCreation(String),

    #[error("No live context")]
    NoContext,

    #[error("Context terminated")]
    Terminated,

    #[error("Standard input closed")]
    StdinClosed(#[from] StdinClosed),

    #[error("Shared buffer error: {0}")]
    SharedBuffer(SharedBufferError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<SharedBufferError> for SandboxError {
    fn from(err: SharedBufferError) -> Self {
        match err {
            SharedBufferError::Closed => SandboxError::Terminated,
            other => SandboxError::SharedBuffer(other),
        }
    }
}

impl From<ChannelClosed> for SandboxError {
    fn from(_: ChannelClosed) -> Self {
        SandboxError::Terminated
    }
}

impl SandboxError {
    /// Whether the controller must tear the context down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::StdinClosed(_) | SandboxError::Terminated | SandboxError::NoContext
        )
    }
}

/// The host's standard input can no longer produce values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("standard input closed")]
pub struct StdinClosed;

/// Failure performing a real network call.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No response was obtained (DNS, connect, reset, timeout).
    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
