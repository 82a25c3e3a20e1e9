//! Canonical set of live connections plus secondary indices for O(1)
//! fan-out lookups.
//!
//! All index mutations for one connection happen under a single critical
//! section acquired through the lock manager in the fixed key order, so a
//! reader never observes a connection present in one index and absent from
//! another. Lookups only ever return `Active` connections.

use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::error::{GatewayError, Result};
use crate::locks::{LockKey, LockManager};
use dashmap::{DashMap, DashSet};
use metrics::gauge;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// What to do when a subject that already holds a connection opens another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Multiple devices per subject (default).
    Allow,
    /// Reject the new connection.
    Reject,
    /// Evict the subject's older connections.
    EvictOlder,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "allow" => Ok(DuplicatePolicy::Allow),
            "reject" => Ok(DuplicatePolicy::Reject),
            "evict-older" => Ok(DuplicatePolicy::EvictOlder),
            other => Err(format!("unknown duplicate policy '{}'", other)),
        }
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Allow,
        }
    }
}

type IndexKey = (String, String);

/// Registry of live connections.
pub struct ConnectionRegistry {
    /// Primary map: connection id → connection.
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// (tenant, branch) → connection ids.
    by_branch: DashMap<IndexKey, DashSet<ConnectionId>>,
    /// (tenant, sector) → connection ids.
    by_sector: DashMap<IndexKey, DashSet<ConnectionId>>,
    /// (tenant, session) → connection ids.
    by_session: DashMap<IndexKey, DashSet<ConnectionId>>,
    /// (tenant, subject) → connection ids.
    by_user: DashMap<IndexKey, DashSet<ConnectionId>>,
    /// tenant → connection ids.
    by_tenant: DashMap<String, DashSet<ConnectionId>>,
    locks: Arc<LockManager>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(locks: Arc<LockManager>, config: RegistryConfig) -> Self {
        Self {
            connections: DashMap::new(),
            by_branch: DashMap::new(),
            by_sector: DashMap::new(),
            by_session: DashMap::new(),
            by_user: DashMap::new(),
            by_tenant: DashMap::new(),
            locks,
            config,
        }
    }

    /// Register a connection and mark it `Active`.
    ///
    /// Returns the connections evicted under the `EvictOlder` policy so the
    /// caller can close them with an explicit code. Fails with
    /// [`GatewayError::Duplicate`] under the `Reject` policy.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<Vec<Arc<Connection>>> {
        let _guard = self.locks.acquire(Self::lock_keys(&conn)).await;

        let user_key = (
            conn.identity.tenant_id.clone(),
            conn.identity.subject_id.clone(),
        );
        let existing = self.active_ids(&self.by_user, &user_key);

        let mut evicted = Vec::new();
        if !existing.is_empty() {
            match self.config.duplicate_policy {
                DuplicatePolicy::Allow => {}
                DuplicatePolicy::Reject => {
                    return Err(GatewayError::Duplicate(conn.identity.subject_id.clone()));
                }
                DuplicatePolicy::EvictOlder => {
                    for old in existing {
                        debug!("Evicting older connection {} for {}", old.id, old.identity.subject_id);
                        // Same order as unregister: leave `Active` before
                        // touching the indices so lookups never see a
                        // half-removed connection.
                        old.set_state(ConnectionState::Closing);
                        self.remove_from_indices(&old);
                        self.connections.remove(&old.id);
                        old.set_state(ConnectionState::Closed);
                        evicted.push(old);
                    }
                }
            }
        }

        self.connections.insert(conn.id, conn.clone());
        self.insert_into_indices(&conn);
        // Visibility flips on last, still inside the critical section.
        conn.set_state(ConnectionState::Active);

        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        info!(
            "Connection {} registered (tenant {}, subject {})",
            conn.id, conn.identity.tenant_id, conn.identity.subject_id
        );
        Ok(evicted)
    }

    /// Remove a connection from the primary map and every index.
    ///
    /// Idempotent; returns the connection if it was present.
    pub async fn unregister(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.connections.get(&conn_id).map(|c| c.clone())?;

        let _guard = self.locks.acquire(Self::lock_keys(&conn)).await;

        // Re-check under the lock: a concurrent unregister may have won.
        if !self.connections.contains_key(&conn_id) {
            return None;
        }

        if conn.state() == ConnectionState::Active {
            conn.set_state(ConnectionState::Closing);
        }
        self.remove_from_indices(&conn);
        self.connections.remove(&conn_id);
        conn.set_state(ConnectionState::Closed);

        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        info!("Connection {} unregistered", conn_id);
        Some(conn)
    }

    pub fn lookup_by_branch(&self, tenant_id: &str, branch_id: &str) -> Vec<Arc<Connection>> {
        self.active_ids(
            &self.by_branch,
            &(tenant_id.to_string(), branch_id.to_string()),
        )
    }

    pub fn lookup_by_sector(&self, tenant_id: &str, sector_id: &str) -> Vec<Arc<Connection>> {
        self.active_ids(
            &self.by_sector,
            &(tenant_id.to_string(), sector_id.to_string()),
        )
    }

    pub fn lookup_by_session(&self, tenant_id: &str, session_id: &str) -> Vec<Arc<Connection>> {
        self.active_ids(
            &self.by_session,
            &(tenant_id.to_string(), session_id.to_string()),
        )
    }

    pub fn lookup_by_user(&self, tenant_id: &str, subject_id: &str) -> Vec<Arc<Connection>> {
        self.active_ids(
            &self.by_user,
            &(tenant_id.to_string(), subject_id.to_string()),
        )
    }

    pub fn lookup_by_tenant(&self, tenant_id: &str) -> Vec<Arc<Connection>> {
        match self.by_tenant.get(tenant_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.connections.get(&id).map(|c| c.clone()))
                .filter(|c| c.is_active())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get(&self, conn_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(conn_id).map(|c| c.clone())
    }

    /// Number of connections in the primary map.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// All connections, for periodic passes (sweeper, revalidation).
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.clone()).collect()
    }

    /// Lock keys for one connection's registry footprint, acquired in the
    /// fixed global order by the lock manager.
    fn lock_keys(conn: &Connection) -> Vec<LockKey> {
        let tenant = &conn.identity.tenant_id;
        let mut keys = vec![
            LockKey::User {
                tenant_id: tenant.clone(),
                user_id: conn.identity.subject_id.clone(),
            },
            LockKey::Branch {
                tenant_id: tenant.clone(),
                branch_id: conn.scope.branch_id.clone(),
            },
        ];
        if let Some(sector) = &conn.scope.sector_id {
            keys.push(LockKey::SectorOrSession {
                tenant_id: tenant.clone(),
                key: sector.clone(),
            });
        }
        if let Some(session) = &conn.scope.session_id {
            keys.push(LockKey::SectorOrSession {
                tenant_id: tenant.clone(),
                key: session.clone(),
            });
        }
        keys
    }

    fn insert_into_indices(&self, conn: &Arc<Connection>) {
        let tenant = &conn.identity.tenant_id;

        self.by_user
            .entry((tenant.clone(), conn.identity.subject_id.clone()))
            .or_default()
            .insert(conn.id);
        self.by_branch
            .entry((tenant.clone(), conn.scope.branch_id.clone()))
            .or_default()
            .insert(conn.id);
        if let Some(sector) = &conn.scope.sector_id {
            self.by_sector
                .entry((tenant.clone(), sector.clone()))
                .or_default()
                .insert(conn.id);
        }
        if let Some(session) = &conn.scope.session_id {
            self.by_session
                .entry((tenant.clone(), session.clone()))
                .or_default()
                .insert(conn.id);
        }
        self.by_tenant
            .entry(tenant.clone())
            .or_default()
            .insert(conn.id);
    }

    fn remove_from_indices(&self, conn: &Arc<Connection>) {
        let tenant = &conn.identity.tenant_id;

        Self::remove_id(
            &self.by_user,
            &(tenant.clone(), conn.identity.subject_id.clone()),
            &conn.id,
        );
        Self::remove_id(
            &self.by_branch,
            &(tenant.clone(), conn.scope.branch_id.clone()),
            &conn.id,
        );
        if let Some(sector) = &conn.scope.sector_id {
            Self::remove_id(&self.by_sector, &(tenant.clone(), sector.clone()), &conn.id);
        }
        if let Some(session) = &conn.scope.session_id {
            Self::remove_id(
                &self.by_session,
                &(tenant.clone(), session.clone()),
                &conn.id,
            );
        }
        if let Some(set) = self.by_tenant.get(tenant) {
            set.remove(&conn.id);
        }
        self.by_tenant
            .remove_if(tenant, |_, set| set.is_empty());
    }

    fn remove_id(
        index: &DashMap<IndexKey, DashSet<ConnectionId>>,
        key: &IndexKey,
        id: &ConnectionId,
    ) {
        if let Some(set) = index.get(key) {
            set.remove(id);
        }
        // Drop empty sets so churn does not grow the index keyspace.
        index.remove_if(key, |_, set| set.is_empty());
    }

    /// Resolve index entries to live, `Active` connections. Stale ids left
    /// by a concurrent unregister are filtered out by the primary lookup.
    fn active_ids(
        &self,
        index: &DashMap<IndexKey, DashSet<ConnectionId>>,
        key: &IndexKey,
    ) -> Vec<Arc<Connection>> {
        match index.get(key) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.connections.get(&id).map(|c| c.clone()))
                .filter(|c| c.is_active())
                .collect(),
            None => Vec::new(),
        }
    }
}
