//! WebSocket protocol message types and close codes.
//!
//! Defines the JSON message format for client-server communication. All
//! business messages flow server → client; the only client-initiated
//! message the gateway recognizes is `ping`.

use common::Event;
use serde::{Deserialize, Serialize};

/// Close-code vocabulary clients branch on. The client always receives an
/// explicit code rather than a dropped connection with no explanation.
pub mod close_code {
    /// Normal close; client retries with standard backoff.
    pub const NORMAL: u16 = 1000;
    /// Server going away (graceful shutdown) or connection evicted
    /// (replaced by a newer device, heartbeat timeout, stalled writes).
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (bad origin). No retry.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too large. No retry.
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    /// Auth failed or expired. Re-authenticate before reconnecting.
    pub const AUTH_FAILED: u16 = 4001;
    /// Forbidden (role, branch, duplicate policy). No retry.
    pub const FORBIDDEN: u16 = 4003;
    /// Rate limited. No retry, or long backoff.
    pub const RATE_LIMITED: u16 = 4029;
}

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level keepalive, answered by the heartbeat protocol.
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Domain event routed to this connection.
    Event {
        event: Event,
    },
    /// Pong response to a client ping.
    Pong,
    /// Error message (for malformed client frames; terminal errors use
    /// close codes instead).
    Error {
        message: String,
        code: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn client_ping_decodes() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn unknown_client_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn event_message_nests_under_event_key() {
        let event = Event {
            event_type: "order.ready".to_string(),
            tenant_id: "t1".to_string(),
            branch_id: "b1".to_string(),
            sector_id: None,
            session_id: None,
            entity_type: "order".to_string(),
            entity_id: "o-1".to_string(),
            payload: serde_json::json!({}),
            occurred_at: Utc::now(),
        };
        let json = serde_json::to_string(&ServerMessage::Event { event }).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""tenant_id":"t1""#));
    }
}
