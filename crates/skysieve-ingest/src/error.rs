//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::resolve::ResolveError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Commit extraction error from the core crate.
    #[error("event error: {0}")]
    Core(#[from] skysieve_core::Error),

    /// Identity resolution error.
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Storage error outside SQLite's own error type.
    #[error("storage error: {0}")]
    Database(String),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
