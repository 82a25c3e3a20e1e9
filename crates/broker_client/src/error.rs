//! Broker boundary error types.

use thiserror::Error;

/// Errors produced by the broker client and its ingestion paths.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The circuit breaker guarding this dependency is open; no I/O was
    /// attempted. Callers apply their own fallback instead of blocking.
    #[error("circuit breaker open: {0}")]
    CircuitOpen(&'static str),

    /// A stream entry could not be decoded into an event.
    #[error("malformed stream entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },

    /// Invalid consumer configuration, detected before startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
