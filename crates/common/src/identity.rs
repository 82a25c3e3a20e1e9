//! Identities resolved by the gateway's authentication strategies.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Role string carried by table-presence identities.
pub const ROLE_TABLE: &str = "table";

/// Immutable identity attached to a connection after authentication.
///
/// Produced once by an auth strategy; periodic revalidation re-checks the
/// underlying credential but never mutates this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: String,
    /// Staff user id, or the table/session id for table-presence sessions.
    pub subject_id: String,
    /// Staff role name, or [`ROLE_TABLE`].
    pub role: String,
    /// Branches this identity may observe.
    pub branch_ids: Vec<String>,
    pub expires_at: DateTime<Utc>,
    /// Interval after which the owning strategy must re-check validity.
    pub revalidate_after: Duration,
}

impl Identity {
    /// Whether this is a low-trust table-presence identity.
    pub fn is_table(&self) -> bool {
        self.role == ROLE_TABLE
    }

    pub fn can_access_branch(&self, branch_id: &str) -> bool {
        self.branch_ids.iter().any(|b| b == branch_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn staff_identity() -> Identity {
        Identity {
            tenant_id: "t1".to_string(),
            subject_id: "u1".to_string(),
            role: "waiter".to_string(),
            branch_ids: vec!["b1".to_string(), "b2".to_string()],
            expires_at: Utc::now() + TimeDelta::minutes(5),
            revalidate_after: Duration::from_secs(300),
        }
    }

    #[test]
    fn branch_access() {
        let id = staff_identity();
        assert!(id.can_access_branch("b1"));
        assert!(!id.can_access_branch("b9"));
    }

    #[test]
    fn table_role_detection() {
        let mut id = staff_identity();
        assert!(!id.is_table());
        id.role = ROLE_TABLE.to_string();
        assert!(id.is_table());
    }
}
