//! Error types for the Tally service.

use thiserror::Error;

use crate::mesh::ClusterError;

/// Main error type for Tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No provider registered under the requested key
    #[error("Unknown counter provider: {0}")]
    UnknownProvider(String),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Replay script errors
    #[error("Replay error: {0}")]
    Replay(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;
