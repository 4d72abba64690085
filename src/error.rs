// this_file: src/error.rs
//! Error types for the fonthub library

use thiserror::Error;

/// Main error type for fonthub operations
#[derive(Debug, Error)]
pub enum Error {
    /// Backend read or write failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A change could not be applied to the font data
    #[error("Change error: {0}")]
    Change(String),

    /// Data key not known to the handler
    #[error("Unknown data key: {0}")]
    UnknownKey(String),

    /// Client proxy call failure
    #[error("Client error: {0}")]
    Client(String),

    /// The write scheduler has terminated and can no longer persist edits
    #[error("Write scheduler stopped: {0}")]
    SchedulerStopped(String),

    /// Invalid input parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type alias for fonthub operations
pub type Result<T> = std::result::Result<T, Error>;
