//! Error type shared by the client, sessions and the registry.

use std::time::Duration;

use crate::buffer::BufferId;

/// Errors surfaced to the host, one per failed command.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Lifecycle endpoint unreachable, or it answered with a non-success status.
    #[error("Failed to reach kernel server: {0}")]
    Connection(String),

    /// Malformed or unexpected message shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `wait_for_ready` ran out of time.
    #[error("Kernel did not become idle within {0:?}")]
    Timeout(Duration),

    /// The overlap resolver refused to delete a cell that is still running.
    #[error("Cell overlaps a running cell of kernel '{kernel_id}'; try again once it finishes")]
    OverlapConflict { kernel_id: String },

    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// Operation attempted after deinit, or after the receiver stopped on its own.
    #[error("Kernel '{0}' is no longer running")]
    KernelDead(String),

    #[error("Invalid cell span: {0}")]
    InvalidSpan(String),

    #[error("No kernel is attached to buffer {0}")]
    NotAttached(BufferId),

    #[error("Invalid session data: {0}")]
    InvalidSessionData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl From<reqwest::Error> for KernelError {
    fn from(err: reqwest::Error) -> Self {
        KernelError::Connection(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for KernelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        KernelError::Connection(err.to_string())
    }
}

impl From<url::ParseError> for KernelError {
    fn from(err: url::ParseError) -> Self {
        KernelError::Connection(format!("invalid server URL: {}", err))
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Protocol(err.to_string())
    }
}
