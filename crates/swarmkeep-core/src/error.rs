//! Error types for swarmkeep.
//!
//! Coordinator-side handlers never surface these across the transport; they
//! fold failures into the `error` field of the reply. Consumer-side calls
//! return them to the calling scenario, which decides whether to retry,
//! continue or abort.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for swarmkeep.
#[derive(Debug, Error)]
pub enum SwarmError {
    // Consumer-side waits
    #[error("no data received within {timeout:?}")]
    NoDataReceived { timeout: Duration },

    #[error("no value popped from \"{key}\" within {wait:?}")]
    PopTimeout { key: String, wait: Duration },

    #[error("correlation id {uid} already has a pending request")]
    DuplicateCorrelation { uid: u64 },

    // Coordinator replies
    #[error("keystore {action} on \"{key}\" failed: {message}")]
    Keystore {
        action: String,
        key: String,
        message: String,
    },

    #[error("unknown testdata action \"{0}\" received")]
    UnknownTestdataAction(String),

    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    // Transport
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("connection to coordinator at {addr} lost")]
    ConnectionLost { addr: String },

    #[error("unknown client \"{client_id}\"")]
    UnknownClient { client_id: String },

    // Testdata
    #[error("failed to materialize \"{key}\": {message}")]
    Materialize { key: String, message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for swarmkeep operations.
pub type Result<T> = std::result::Result<T, SwarmError>;

impl From<std::io::Error> for SwarmError {
    fn from(err: std::io::Error) -> Self {
        SwarmError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        SwarmError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl SwarmError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SwarmError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a materialization error for a testdata variable.
    pub fn materialize(key: impl Into<String>, message: impl Into<String>) -> Self {
        SwarmError::Materialize {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if the failed call may succeed when issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwarmError::NoDataReceived { .. }
                | SwarmError::Transport { .. }
                | SwarmError::ConnectionLost { .. }
        )
    }
}
