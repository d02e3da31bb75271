//! Error types for shopsync-core

use thiserror::Error;

use crate::external::ExternalError;

/// Result type alias using shopsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shopsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller input rejected before any external call
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Product not found in the mirror
    #[error("Product not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed on a mirror write
    #[error("Version conflict for product {id}: expected local version {expected}")]
    Conflict { id: String, expected: u64 },

    /// External resource call failed (after retries, for transient failures)
    #[error(transparent)]
    External(#[from] ExternalError),

    /// Another worker holds a live lease on this idempotency key
    #[error("Operation with idempotency key {0} is already in progress")]
    OperationInProgress(String),

    /// No usable session for the external resource
    #[error("Session unavailable: {0}")]
    Session(String),

    /// Idempotency key reused for a different request
    #[error("Idempotency key {0} was already used for a different request")]
    IdempotencyMismatch(String),
}

impl Error {
    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this is an optimistic concurrency conflict
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
