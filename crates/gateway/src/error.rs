//! Gateway error types.

use crate::protocol::close_code;
use thiserror::Error;

/// Gateway error type.
///
/// Errors local to one connection (auth, rate limit, write failure) are
/// terminal for that connection only and never propagate past it.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or expired credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Valid credential, disallowed action (role, branch, duplicate policy).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Handshake origin not on the allow-list.
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),

    /// Per-connection message budget exceeded.
    #[error("rate limited")]
    RateLimited,

    /// Inbound frame larger than the accepted maximum.
    #[error("message too large")]
    MessageTooLarge,

    /// Subject already holds a connection under a policy forbidding it.
    #[error("duplicate connection for subject {0}")]
    Duplicate(String),

    /// JWT decode/verify error.
    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Broker boundary error.
    #[error(transparent)]
    Broker(#[from] broker_client::BrokerError),

    /// Per-connection outbound channel closed or full.
    #[error("channel send error")]
    ChannelSend,
}

impl GatewayError {
    /// WebSocket close code for errors that terminate a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::Auth(_) | GatewayError::Jwt(_) => close_code::AUTH_FAILED,
            GatewayError::Forbidden(_) | GatewayError::Duplicate(_) => close_code::FORBIDDEN,
            GatewayError::OriginNotAllowed(_) => close_code::POLICY_VIOLATION,
            GatewayError::RateLimited => close_code::RATE_LIMITED,
            GatewayError::MessageTooLarge => close_code::MESSAGE_TOO_LARGE,
            _ => close_code::NORMAL,
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
