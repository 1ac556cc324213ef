//! Error types for the query cache
//!
//! The extractor never fails and store misses are ordinary outcomes, so almost every
//! variant here comes from parsing a cache policy directive or validating configuration.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The expiration mode field of a policy directive is not a known mode
    #[error("Invalid expiration mode: {0:?} (expected Absolute, Sliding or NeverRemove)")]
    InvalidExpirationMode(String),

    /// The timeout field of a policy directive is not a valid timespan
    #[error("Invalid timeout: {value:?}: {reason}")]
    InvalidTimeout { value: String, reason: String },

    /// The cacheable field of a policy directive is not a boolean
    #[error("Invalid cacheable flag: {0:?} (expected True or False)")]
    InvalidCacheableFlag(String),

    /// A directive line was found but its structure is unusable
    #[error("Malformed cache policy directive: {0}")]
    MalformedDirective(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The primary map and the reverse tag index disagree
    #[error("Inconsistent dependency index: {0}")]
    InconsistentIndex(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
