//! Error types for the Gatekeeper rate limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Gatekeeper operations.
///
/// An exceeded limit is not an error: it is reported through
/// [`RateLimitResult::allowed`](crate::ratelimit::RateLimitResult::allowed).
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid limiter or service configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A check was issued with arguments no limiter can satisfy
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backing store failed; never converted into an allow or deny
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
