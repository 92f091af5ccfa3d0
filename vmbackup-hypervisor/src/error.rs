//! Error types for the hypervisor gateway.

use thiserror::Error;

/// Errors that can occur while talking to the hypervisor.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Guest was not found.
    #[error("Guest not found: {0}")]
    GuestNotFound(String),

    /// Failed to start a guest.
    #[error("Failed to start guest: {0}")]
    StartFailed(String),

    /// The shutdown request was rejected.
    #[error("Failed to request guest shutdown: {0}")]
    ShutdownFailed(String),

    /// Query failed (state, definition, listing).
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// Guest is in an invalid state for the requested operation.
    #[error("Invalid guest state for operation: {0}")]
    InvalidState(String),

    /// Domain XML could not be parsed.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
