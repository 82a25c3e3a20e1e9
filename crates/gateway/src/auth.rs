//! Authentication strategies.
//!
//! Two credential kinds behind one capability surface: a staff token
//! (short TTL, signed with the staff secret) and a table-presence token
//! (long low-trust sessions, signed with the table secret). Each strategy
//! verifies a token into an [`Identity`] and re-checks it on its own
//! schedule without dropping the connection on the common case.

use crate::error::{GatewayError, Result};
use crate::protocol::close_code;
use crate::registry::ConnectionRegistry;
use chrono::{DateTime, Utc};
use common::{Identity, ROLE_TABLE};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Auth configuration. Secrets are required at startup; missing secrets
/// are a fatal config error, not a per-connection one.
#[derive(Clone)]
pub struct AuthConfig {
    pub staff_secret: String,
    pub table_secret: String,
    /// Handshake `Origin` allow-list.
    pub allowed_origins: Vec<String>,
    /// Escape hatch for local development. Only honored when
    /// `environment` is also "development".
    pub allow_any_origin: bool,
    pub environment: String,
    /// Staff identities are re-checked on this interval.
    pub staff_revalidate_after: Duration,
    /// Table identities are re-checked on this interval.
    pub table_revalidate_after: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            staff_secret: String::new(),
            table_secret: String::new(),
            allowed_origins: Vec::new(),
            allow_any_origin: false,
            environment: "production".to_string(),
            staff_revalidate_after: Duration::from_secs(5 * 60),
            table_revalidate_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Tolerated clock skew between the token issuer and this process, in
/// seconds. Expiry checks use this instead of jsonwebtoken's wider
/// default so revocation takes effect promptly.
const CLOCK_SKEW_LEEWAY_SECS: u64 = 30;

fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
    validation
}

/// Claims carried by a staff token.
#[derive(Debug, Serialize, Deserialize)]
pub struct StaffClaims {
    /// Staff user id.
    pub sub: String,
    /// Tenant id.
    pub tid: String,
    pub role: String,
    /// Branches this user may receive events for.
    pub branches: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

/// Claims carried by a table-presence token.
#[derive(Debug, Serialize, Deserialize)]
pub struct TableClaims {
    /// Table id.
    pub sub: String,
    /// Tenant id.
    pub tid: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

/// Pluggable credential verification. Exactly two variants; each resolves
/// a token into an [`Identity`] and can cheaply re-check it later.
pub enum AuthStrategy {
    Staff {
        key: DecodingKey,
        revalidate_after: Duration,
    },
    TablePresence {
        key: DecodingKey,
        revalidate_after: Duration,
    },
}

impl AuthStrategy {
    pub fn staff(config: &AuthConfig) -> Self {
        AuthStrategy::Staff {
            key: DecodingKey::from_secret(config.staff_secret.as_bytes()),
            revalidate_after: config.staff_revalidate_after,
        }
    }

    pub fn table_presence(config: &AuthConfig) -> Self {
        AuthStrategy::TablePresence {
            key: DecodingKey::from_secret(config.table_secret.as_bytes()),
            revalidate_after: config.table_revalidate_after,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthStrategy::Staff { .. } => "staff",
            AuthStrategy::TablePresence { .. } => "table",
        }
    }

    /// Verify a credential and resolve it to an identity.
    pub fn authenticate(&self, token: &str) -> Result<Identity> {
        let validation = validation();
        match self {
            AuthStrategy::Staff {
                key,
                revalidate_after,
            } => {
                let data = decode::<StaffClaims>(token, key, &validation)?;
                let claims = data.claims;
                if claims.role == ROLE_TABLE {
                    return Err(GatewayError::Auth(
                        "staff token carries a table role".to_string(),
                    ));
                }
                Ok(Identity {
                    tenant_id: claims.tid,
                    subject_id: claims.sub,
                    role: claims.role,
                    branch_ids: claims.branches,
                    expires_at: timestamp(claims.exp)?,
                    revalidate_after: *revalidate_after,
                })
            }
            AuthStrategy::TablePresence {
                key,
                revalidate_after,
            } => {
                let data = decode::<TableClaims>(token, key, &validation)?;
                let claims = data.claims;
                Ok(Identity {
                    tenant_id: claims.tid,
                    subject_id: claims.sub,
                    role: ROLE_TABLE.to_string(),
                    branch_ids: vec![claims.branch],
                    expires_at: timestamp(claims.exp)?,
                    revalidate_after: *revalidate_after,
                })
            }
        }
    }

    /// Session a table credential is pinned to, if any. Staff
    /// credentials carry no session binding.
    pub fn session_binding(&self, token: &str) -> Result<Option<String>> {
        match self {
            AuthStrategy::Staff { .. } => Ok(None),
            AuthStrategy::TablePresence { key, .. } => {
                let data = decode::<TableClaims>(token, key, &validation())?;
                Ok(data.claims.session_id)
            }
        }
    }

    /// Re-check a previously accepted credential. Signature and expiry
    /// only; a failure means the underlying session has ended.
    pub fn revalidate(&self, token: &str) -> bool {
        self.authenticate(token).is_ok()
    }

    /// Whether this strategy governs the given identity.
    pub fn governs(&self, identity: &Identity) -> bool {
        match self {
            AuthStrategy::Staff { .. } => !identity.is_table(),
            AuthStrategy::TablePresence { .. } => identity.is_table(),
        }
    }
}

fn timestamp(exp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| GatewayError::Auth(format!("invalid expiry timestamp {}", exp)))
}

/// Validate the handshake `Origin` against the allow-list.
///
/// The development escape hatch is double-gated: `allow_any_origin` alone
/// does nothing outside the development environment.
pub fn check_origin(origin: Option<&str>, config: &AuthConfig) -> Result<()> {
    if config.allow_any_origin && config.environment == "development" {
        return Ok(());
    }
    match origin {
        Some(origin) if config.allowed_origins.iter().any(|o| o == origin) => Ok(()),
        Some(origin) => Err(GatewayError::OriginNotAllowed(origin.to_string())),
        None => Err(GatewayError::OriginNotAllowed("<missing>".to_string())),
    }
}

/// Periodic revalidation task for one strategy's schedule.
///
/// Re-checks each governed connection's retained token once its
/// `revalidate_after` interval has elapsed. A failure closes the
/// connection with the auth close code; the sweep and the socket task do
/// the actual teardown.
pub struct Revalidator {
    registry: Arc<ConnectionRegistry>,
    strategy: AuthStrategy,
    interval: Duration,
}

impl Revalidator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        strategy: AuthStrategy,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            strategy,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            "Revalidator ({}) started, interval {:?}",
            self.strategy.name(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Revalidator ({}) shutting down", self.strategy.name());
                    break;
                }
                _ = ticker.tick() => {
                    self.pass().await;
                }
            }
        }
    }

    async fn pass(&self) {
        let now = Utc::now().timestamp_millis();
        let mut revoked = 0usize;
        for conn in self.registry.snapshot() {
            if !self.strategy.governs(&conn.identity) || !conn.is_active() {
                continue;
            }
            let due = conn.last_revalidated_ms()
                + conn.identity.revalidate_after.as_millis() as i64;
            if now < due {
                continue;
            }
            if self.strategy.revalidate(&conn.token) {
                conn.mark_revalidated();
                debug!("Connection {} revalidated ({})", conn.id, self.strategy.name());
            } else {
                warn!(
                    "Connection {} failed {} revalidation, closing",
                    conn.id,
                    self.strategy.name()
                );
                conn.close(close_code::AUTH_FAILED, "credential expired");
                self.registry.unregister(conn.id).await;
                counter!("gateway_revalidation_failures_total").increment(1);
                revoked += 1;
            }
        }
        if revoked > 0 {
            info!(
                "Revalidation pass ({}) closed {} connections",
                self.strategy.name(),
                revoked
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const STAFF_SECRET: &str = "staff-test-secret";
    const TABLE_SECRET: &str = "table-test-secret";

    fn test_config() -> AuthConfig {
        AuthConfig {
            staff_secret: STAFF_SECRET.to_string(),
            table_secret: TABLE_SECRET.to_string(),
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..AuthConfig::default()
        }
    }

    fn staff_token(secret: &str, exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = StaffClaims {
            sub: "u1".to_string(),
            tid: "t1".to_string(),
            role: "waiter".to_string(),
            branches: vec!["b1".to_string(), "b2".to_string()],
            exp: now + exp_offset_secs,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn table_token(exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = TableClaims {
            sub: "table-7".to_string(),
            tid: "t1".to_string(),
            branch: "b1".to_string(),
            session_id: Some("sess-42".to_string()),
            exp: now + exp_offset_secs,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TABLE_SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn staff_token_resolves_identity() {
        let strategy = AuthStrategy::staff(&test_config());
        let identity = strategy.authenticate(&staff_token(STAFF_SECRET, 3600)).unwrap();
        assert_eq!(identity.tenant_id, "t1");
        assert_eq!(identity.subject_id, "u1");
        assert_eq!(identity.role, "waiter");
        assert_eq!(identity.branch_ids, vec!["b1", "b2"]);
        assert!(!identity.is_table());
    }

    #[test]
    fn table_token_resolves_table_identity() {
        let strategy = AuthStrategy::table_presence(&test_config());
        let identity = strategy.authenticate(&table_token(3600)).unwrap();
        assert_eq!(identity.role, ROLE_TABLE);
        assert_eq!(identity.branch_ids, vec!["b1"]);
        assert!(identity.is_table());
    }

    #[test]
    fn expired_token_is_rejected() {
        let strategy = AuthStrategy::staff(&test_config());
        assert!(strategy.authenticate(&staff_token(STAFF_SECRET, -3600)).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let strategy = AuthStrategy::staff(&test_config());
        assert!(strategy
            .authenticate(&staff_token("some-other-secret", 3600))
            .is_err());
    }

    #[test]
    fn staff_strategy_does_not_accept_table_tokens() {
        let strategy = AuthStrategy::staff(&test_config());
        assert!(strategy.authenticate(&table_token(3600)).is_err());
    }

    #[test]
    fn revalidate_tracks_token_validity() {
        let strategy = AuthStrategy::table_presence(&test_config());
        assert!(strategy.revalidate(&table_token(3600)));
        assert!(!strategy.revalidate(&table_token(-60)));
    }

    #[test]
    fn expiry_tolerates_minor_clock_skew() {
        let strategy = AuthStrategy::staff(&test_config());
        // Just inside the leeway window.
        assert!(strategy.authenticate(&staff_token(STAFF_SECRET, -10)).is_ok());
        // Just past it.
        assert!(strategy
            .authenticate(&staff_token(STAFF_SECRET, -(CLOCK_SKEW_LEEWAY_SECS as i64 + 5)))
            .is_err());
    }

    #[test]
    fn table_token_exposes_session_binding() {
        let table = AuthStrategy::table_presence(&test_config());
        assert_eq!(
            table.session_binding(&table_token(3600)).unwrap(),
            Some("sess-42".to_string())
        );
        let staff = AuthStrategy::staff(&test_config());
        assert_eq!(
            staff.session_binding(&staff_token(STAFF_SECRET, 3600)).unwrap(),
            None
        );
    }

    #[test]
    fn origin_allow_list_is_enforced() {
        let config = test_config();
        assert!(check_origin(Some("https://app.example.com"), &config).is_ok());
        assert!(check_origin(Some("https://evil.example.com"), &config).is_err());
        assert!(check_origin(None, &config).is_err());
    }

    #[test]
    fn any_origin_escape_hatch_is_double_gated() {
        let mut config = test_config();
        config.allow_any_origin = true;
        // Flag alone is not enough outside development.
        assert!(check_origin(Some("http://localhost:3000"), &config).is_err());
        config.environment = "development".to_string();
        assert!(check_origin(Some("http://localhost:3000"), &config).is_ok());
    }
}
