//! Dead-connection sweeper.
//!
//! Periodic reclamation of sockets that went silent past the heartbeat
//! threshold. Each pass is bounded to a maximum number of evictions so a
//! mass disconnect does not turn one sweep into a long pause; the leftover
//! stale connections are picked up on the next pass.

use crate::heartbeat::HeartbeatTracker;
use crate::protocol::close_code;
use crate::registry::ConnectionRegistry;
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweep passes.
    pub interval: Duration,
    /// Evictions allowed per pass.
    pub max_evictions: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_evictions: 500,
        }
    }
}

/// Periodic task evicting stale connections.
pub struct Sweeper {
    registry: Arc<ConnectionRegistry>,
    tracker: HeartbeatTracker,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tracker: HeartbeatTracker,
        config: SweeperConfig,
    ) -> Self {
        Self {
            registry,
            tracker,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            "Sweeper started: interval {:?}, max {} evictions per pass",
            self.config.interval, self.config.max_evictions
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One bounded eviction pass. Returns the number of connections evicted.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let mut evicted = 0;
        for conn in self.registry.snapshot() {
            if evicted >= self.config.max_evictions {
                warn!(
                    "Sweep pass hit eviction cap ({}), deferring the rest",
                    self.config.max_evictions
                );
                break;
            }
            if !conn.is_active() || !self.tracker.is_stale(&conn, now) {
                continue;
            }
            info!(
                "Evicting stale connection {} (silent {} ms)",
                conn.id,
                now - conn.last_pong_ms()
            );
            // Not a normal close: the client should notice it was evicted
            // and reconnect.
            conn.close(close_code::GOING_AWAY, "heartbeat timeout");
            self.registry.unregister(conn.id).await;
            counter!("gateway_stale_evictions_total").increment(1);
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatConfig;
    use crate::registry::tests::{connection, registry};
    use crate::registry::DuplicatePolicy;

    fn sweeper(registry: Arc<ConnectionRegistry>, max_evictions: usize) -> Sweeper {
        Sweeper::new(
            registry,
            HeartbeatTracker::new(HeartbeatConfig::default()),
            SweeperConfig {
                interval: Duration::from_secs(10),
                max_evictions,
            },
        )
    }

    #[tokio::test]
    async fn fresh_connections_survive_a_sweep() {
        let reg = Arc::new(registry(DuplicatePolicy::Allow));
        let (conn, _rx) = connection("t1", "u1", "waiter", "b1", None, None);
        reg.register(conn).await.unwrap();

        let evicted = sweeper(reg.clone(), 500).sweep().await;
        assert_eq!(evicted, 0);
        assert_eq!(reg.count(), 1);
    }

    #[tokio::test]
    async fn silent_connections_are_closed_and_unregistered() {
        let reg = Arc::new(registry(DuplicatePolicy::Allow));
        let (conn, _rx) = connection("t1", "u1", "waiter", "b1", None, None);
        reg.register(conn.clone()).await.unwrap();

        // Zero-threshold tracker: everything counts as stale.
        let sweeper = Sweeper::new(
            reg.clone(),
            HeartbeatTracker::new(HeartbeatConfig {
                ping_interval: Duration::from_millis(0),
                pong_window: Duration::from_millis(0),
                missed_limit: 0,
            }),
            SweeperConfig::default(),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        let evicted = sweeper.sweep().await;
        assert_eq!(evicted, 1);
        assert_eq!(reg.count(), 0);
        let reason = conn.close_reason().unwrap();
        assert_eq!(reason.code, close_code::GOING_AWAY);
    }

    #[tokio::test]
    async fn sweep_pass_is_bounded() {
        let reg = Arc::new(registry(DuplicatePolicy::Allow));
        for i in 0..5 {
            let (conn, rx) = connection("t1", &format!("u{}", i), "waiter", "b1", None, None);
            std::mem::forget(rx);
            reg.register(conn).await.unwrap();
        }

        let sweeper = Sweeper::new(
            reg.clone(),
            HeartbeatTracker::new(HeartbeatConfig {
                ping_interval: Duration::from_millis(0),
                pong_window: Duration::from_millis(0),
                missed_limit: 0,
            }),
            SweeperConfig {
                interval: Duration::from_secs(10),
                max_evictions: 2,
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(sweeper.sweep().await, 2);
        assert_eq!(reg.count(), 3);
        assert_eq!(sweeper.sweep().await, 2);
        assert_eq!(sweeper.sweep().await, 1);
        assert_eq!(reg.count(), 0);
    }
}
