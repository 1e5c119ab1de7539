//! Error types for the catalog cache

use thiserror::Error;

use crate::domain::ScopeKind;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the catalog cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller-facing Errors
    // =========================================================================
    /// Slot scope could not be initialized from the backing store
    #[error("{0} slot cache is not available at this moment, try after some time")]
    NotReady(ScopeKind),

    /// Ordinal outside the capacity of a bounded scope
    #[error("slot {ordinal} is outside the supported range 1..={capacity}")]
    SlotOutOfRange { ordinal: u32, capacity: u32 },

    // =========================================================================
    // Backing Store Errors
    // =========================================================================
    /// Generic backing-store failure
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Row did not have the expected shape
    #[error("Failed to decode row: {0}")]
    Decode(String),

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true when the caller should retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }
}
