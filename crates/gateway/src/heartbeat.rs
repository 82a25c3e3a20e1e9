//! Liveness protocol bookkeeping.
//!
//! The server pings every 30 s and expects a pong within a 10 s window.
//! Three consecutive missed windows mark the connection stale. The tracker
//! only reports staleness; the sweeper performs the actual close and
//! unregister.

use crate::connection::Connection;
use std::time::Duration;

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Window after each ping within which a pong must arrive.
    pub pong_window: Duration,
    /// Consecutive missed windows before the connection is stale.
    pub missed_limit: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_window: Duration::from_secs(10),
            missed_limit: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Silence threshold: a connection whose last pong is older than this
    /// has missed `missed_limit` windows in a row.
    pub fn stale_after(&self) -> Duration {
        self.ping_interval * self.missed_limit + self.pong_window
    }
}

/// Detects silently-dead connections from pong timestamps.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    config: HeartbeatConfig,
}

impl HeartbeatTracker {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Whether the connection has been silent past the staleness threshold.
    pub fn is_stale(&self, conn: &Connection, now_ms: i64) -> bool {
        let silent_ms = now_ms - conn.last_pong_ms();
        silent_ms > self.config.stale_after().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Scope};
    use chrono::{TimeDelta, Utc};
    use common::Identity;
    use tokio::sync::mpsc;

    fn conn() -> Connection {
        let (tx, _rx) = mpsc::channel(1);
        Connection::new(
            Identity {
                tenant_id: "t1".to_string(),
                subject_id: "u1".to_string(),
                role: "waiter".to_string(),
                branch_ids: vec!["b1".to_string()],
                expires_at: Utc::now() + TimeDelta::hours(1),
                revalidate_after: Duration::from_secs(300),
            },
            Scope {
                branch_id: "b1".to_string(),
                sector_id: None,
                session_id: None,
            },
            "token".to_string(),
            tx,
        )
    }

    #[test]
    fn stale_after_is_three_windows_plus_grace() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.stale_after(), Duration::from_secs(100));
    }

    #[test]
    fn fresh_connection_is_not_stale() {
        let tracker = HeartbeatTracker::new(HeartbeatConfig::default());
        let conn = conn();
        assert!(!tracker.is_stale(&conn, Utc::now().timestamp_millis()));
    }

    #[test]
    fn silence_past_threshold_is_stale() {
        let tracker = HeartbeatTracker::new(HeartbeatConfig::default());
        let conn = conn();
        let later = conn.last_pong_ms() + 101_000;
        assert!(tracker.is_stale(&conn, later));
    }

    #[test]
    fn recent_pong_clears_staleness() {
        let tracker = HeartbeatTracker::new(HeartbeatConfig::default());
        let conn = conn();
        let later = conn.last_pong_ms() + 101_000;
        assert!(tracker.is_stale(&conn, later));
        conn.record_pong();
        assert!(!tracker.is_stale(&conn, Utc::now().timestamp_millis()));
    }
}
