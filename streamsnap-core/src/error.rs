//! Error taxonomy for the replication core.
//!
//! Content-integrity failures abort the current batch but leave the interim
//! checkpoint in place, so a retry resumes instead of starting over.
//! Coordination races are not surfaced here at all — conditional operations
//! report "condition not met" through their return value and callers retry.

use crate::treestore::StoreError;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors raised by ingestion, scheduling, and snapshot construction.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// A file's streamed byte count disagreed with the preview. The batch is
    /// aborted and the last checkpoint is kept for retry.
    #[error("size mismatch for {path}: wrote {actual} bytes, preview reported {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// The version-control event stream violated the open/write/close protocol.
    #[error("depot protocol error: {0}")]
    Protocol(String),

    /// The coordination backend failed (connection, command, or decode).
    #[error("coordination error: {0}")]
    Coordination(String),

    /// The tree store rejected an operation.
    #[error("tree store error: {0}")]
    Store(#[from] StoreError),

    /// A build was interrupted by shutdown after finishing its current batch.
    #[error("replication interrupted; checkpoint saved")]
    Interrupted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for ReplicationError {
    fn from(e: bincode::Error) -> Self {
        ReplicationError::Serialization(e.to_string())
    }
}
