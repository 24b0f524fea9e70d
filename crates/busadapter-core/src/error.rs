//! Error types for `busadapter` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using `busadapter` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `busadapter` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials file could not be read or parsed
    #[error("can't read credentials from {}: {reason}", path.display())]
    Credentials { path: PathBuf, reason: String },

    /// Subscriptions file could not be read
    #[error("can't read subscriptions from {}: {source}", path.display())]
    Subscriptions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
