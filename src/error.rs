//! Error types for the tierlimit service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for tierlimit operations.
#[derive(Error, Debug)]
pub enum TierlimitError {
    /// Malformed subject or limit, rejected before any state is touched
    #[error("Validation error: {0}")]
    Validation(String),

    /// The shared counter store could not be reached at startup
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The local cache was asked to hold a state it cannot represent
    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for tierlimit operations.
pub type Result<T> = std::result::Result<T, TierlimitError>;
