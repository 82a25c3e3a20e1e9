//! Event router: inbound events → target connection sets.
//!
//! Resolution is most-specific-wins, and every resolution intersects with
//! the event's tenant as the final, unconditional predicate: a scoping bug
//! elsewhere can never leak an event across tenants.

use crate::broadcaster::Broadcaster;
use crate::connection::{Connection, ConnectionId};
use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use broker_client::EventSink;
use common::Event;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps an event to its target connection set via the registry.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
}

impl EventRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve the target set for one event.
    ///
    /// - `session_id` present → connections subscribed to that session;
    /// - else `sector_id` present → connections in that sector plus
    ///   branch-wide staff;
    /// - else → all connections in the branch.
    pub fn resolve(&self, event: &Event) -> Vec<Arc<Connection>> {
        let tenant = &event.tenant_id;

        let mut targets = if let Some(session) = &event.session_id {
            self.registry.lookup_by_session(tenant, session)
        } else if let Some(sector) = &event.sector_id {
            let mut targets = self.registry.lookup_by_sector(tenant, sector);
            let mut seen: HashSet<ConnectionId> = targets.iter().map(|c| c.id).collect();
            // Branch-wide staff see every sector of their branch.
            for conn in self.registry.lookup_by_branch(tenant, &event.branch_id) {
                if !conn.identity.is_table() && seen.insert(conn.id) {
                    targets.push(conn);
                }
            }
            targets
        } else {
            self.registry.lookup_by_branch(tenant, &event.branch_id)
        };

        // Tenant filter last, unconditionally.
        targets.retain(|conn| conn.identity.tenant_id == event.tenant_id);
        targets
    }
}

/// Glue between the ingestion paths and the broadcaster: validates the
/// event, resolves targets, and enqueues the fan-out.
pub struct EventDispatcher {
    router: EventRouter,
    broadcaster: Arc<Broadcaster>,
}

impl EventDispatcher {
    pub fn new(router: EventRouter, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            router,
            broadcaster,
        }
    }
}

#[async_trait]
impl EventSink for EventDispatcher {
    async fn deliver(&self, event: Event) -> Result<(), String> {
        if !event.has_valid_scope() {
            // Invalid scoping drops the event with a counted metric; it
            // never crashes the router and is not worth a retry.
            counter!("gateway_routing_invalid_scope_total").increment(1);
            warn!(
                "Dropping event '{}' with invalid scope (tenant '{}', branch '{}')",
                event.event_type, event.tenant_id, event.branch_id
            );
            return Ok(());
        }

        counter!("gateway_events_received_total").increment(1);

        let targets = self.router.resolve(&event);
        if targets.is_empty() {
            debug!(
                "No targets for event '{}' in branch {}",
                event.event_type, event.branch_id
            );
            return Ok(());
        }

        debug!(
            "Routing '{}' to {} connections",
            event.event_type,
            targets.len()
        );

        // Serialize once; the broadcaster shares the payload across jobs.
        let payload = serde_json::to_string(&ServerMessage::Event { event })
            .map_err(|e| format!("serialize failed: {}", e))?;

        self.broadcaster.enqueue(targets, payload).await;
        counter!("gateway_events_routed_total").increment(1);
        Ok(())
    }
}
