//! Error types for pulse-store.

use std::path::PathBuf;

/// Result type for pulse-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pulse-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The database was written by a newer version of this crate.
    #[error("Unsupported schema version {found} (this build understands up to {supported})")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// CSV export error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
