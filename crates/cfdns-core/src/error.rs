//! Error types for cfdns
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for cfdns operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cfdns
#[derive(Error, Debug)]
pub enum Error {
    /// Every address-echo service was exhausted without a valid answer
    #[error("No {0} address available from any service")]
    NoAddressAvailable(&'static str),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limiting errors
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Record or zone not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The credential cannot see the configured zone
    #[error("Zone {0} is not accessible with the configured token")]
    ZoneRejected(String),

    /// Provider-specific error
    #[error("Provider error ({provider}): {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// Submission to a worker pool that was closed or aborted
    #[error("Worker pool is closed")]
    PoolClosed,

    /// The governing cancellation token fired before the work settled
    #[error("Operation cancelled")]
    Cancelled,

    /// A single bounded call exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A worker dropped a task without settling its handle
    #[error("Task was dropped before completing")]
    TaskLost,
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a provider-specific error
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// True when the error stems from cancellation rather than a failed call
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for the "resource unavailable" class (closed or aborted pool)
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }
}
