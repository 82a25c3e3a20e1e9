//! Domain events emitted by the transactional backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable domain event received from the broker.
///
/// Routing derives a target set from the scoping fields (`tenant_id`,
/// `branch_id`, `sector_id`, `session_id`); the event itself is never
/// mutated after decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type (e.g., "order.status_changed", "service.called").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Tenant the event belongs to. Routing never crosses this boundary.
    pub tenant_id: String,
    /// Branch the event happened in.
    pub branch_id: String,
    /// Sector within the branch, if the event is sector-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,
    /// Table session, if the event is session-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Kind of entity the event refers to (e.g., "order", "payment").
    pub entity_type: String,
    /// Identifier of that entity.
    pub entity_id: String,
    /// Opaque event payload, forwarded to clients unchanged.
    pub payload: serde_json::Value,
    /// When the backend recorded the event.
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Check the scoping fields required for routing.
    ///
    /// An event that fails this check is dropped with a counted metric,
    /// never routed.
    pub fn has_valid_scope(&self) -> bool {
        !self.tenant_id.is_empty() && !self.branch_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "type": "order.status_changed",
            "tenant_id": "t1",
            "branch_id": "b1",
            "sector_id": "s1",
            "entity_type": "order",
            "entity_id": "o-42",
            "payload": {"status": "ready"},
            "occurred_at": "2026-08-01T12:00:00Z"
        }"#
    }

    #[test]
    fn decodes_with_optional_scope_absent() {
        let event: Event = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(event.event_type, "order.status_changed");
        assert_eq!(event.sector_id.as_deref(), Some("s1"));
        assert!(event.session_id.is_none());
        assert!(event.has_valid_scope());
    }

    #[test]
    fn empty_tenant_is_invalid_scope() {
        let mut event: Event = serde_json::from_str(sample_json()).unwrap();
        event.tenant_id.clear();
        assert!(!event.has_valid_scope());
    }
}
