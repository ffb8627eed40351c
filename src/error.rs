//! Error types for dirpool.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use crate::volume::ContentType;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Main error type for the storage driver.
#[derive(Error, Debug)]
pub enum StorageError {
    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("Invalid size {value:?}: {reason}")]
    InvalidSize { value: String, reason: String },

    // Volume errors
    #[error("Content type {content_type} not supported for {operation}")]
    ContentTypeUnsupported { operation: &'static str, content_type: ContentType },

    #[error("Missing volume ID for {path:?}")]
    MissingVolumeId { path: PathBuf },

    #[error("Cannot remove volume {volume}: it still has snapshots")]
    HasSnapshots { volume: String },

    #[error("Snapshot not found: {name}")]
    SnapshotNotFound { name: String },

    // Migration errors
    #[error("Migration type not supported: {reason}")]
    UnsupportedMigrationKind { reason: String },

    #[error("Migration protocol error: {0}")]
    Protocol(String),

    // Feature availability errors
    #[error("Feature not implemented: {feature}")]
    NotImplemented { feature: String },

    // Operation context errors
    #[error("Operation cancelled")]
    Cancelled,

    // External collaborator failures
    #[error("{operation} failed at {path:?}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed: {reason}")]
    ProcessFailed { program: String, reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Wrap an I/O error with the operation and path that failed.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { operation, path: path.into(), source }
    }
}
