//! Error types for the ingestion pipeline

use std::path::PathBuf;
use thiserror::Error;

use crate::record::DecodeError;
use crate::registry::FileId;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Everything that can stop an ingestion run.
///
/// All variants except [`IngestError::Cancelled`] are fatal to the run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to walk directory {path}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("No entry for file {0} found in the registry")]
    UnknownFile(FileId),

    #[error("File {0} was already started")]
    AlreadyStarted(FileId),

    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path} at line {line}: {source}")]
    Read {
        path: PathBuf,
        line: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line} of {path} exceeds the maximum line length of {max_bytes} bytes")]
    LineTooLong {
        path: PathBuf,
        line: u64,
        max_bytes: usize,
    },

    #[error("Failed to decode record for file [{path}] at line {line}: {source}")]
    Decode {
        path: PathBuf,
        line: u64,
        #[source]
        source: DecodeError,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to commit batch of {pending} records: {source}")]
    Commit {
        pending: u64,
        #[source]
        source: sqlx::Error,
    },

    #[error("Transaction manager is closed")]
    ManagerClosed,

    #[error("Ingestion was cancelled")]
    Cancelled,

    #[error("Pipeline task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Whether this error is the cooperative-shutdown path rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}
