//! Worker-pool fan-out.
//!
//! A bounded job queue drained by a fixed pool of workers, each performing
//! one socket write per job. Target sets are split into independent jobs so
//! one slow socket cannot block delivery to the rest. Enqueue on a full
//! queue blocks up to a short timeout, then counts the drop — capacity
//! problems are surfaced, never hidden.

use crate::connection::Connection;
use crate::protocol::close_code;
use crate::registry::ConnectionRegistry;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Job queue capacity.
    pub queue_capacity: usize,
    /// Worker pool size.
    pub workers: usize,
    /// How long `enqueue` may block on a full queue before counting a drop.
    pub enqueue_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5_000,
            workers: 10,
            enqueue_timeout: Duration::from_millis(100),
        }
    }
}

/// One per-socket send.
struct Job {
    conn: Arc<Connection>,
    payload: Arc<str>,
}

/// Bounded worker pool performing per-socket sends.
pub struct Broadcaster {
    jobs_tx: mpsc::Sender<Job>,
    config: BroadcasterConfig,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
}

impl Broadcaster {
    /// Start the worker pool.
    pub fn start(config: BroadcasterConfig, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(config.queue_capacity);
        let broadcaster = Arc::new(Self {
            jobs_tx,
            config: config.clone(),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        });

        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        for worker_id in 0..config.workers {
            let jobs_rx = jobs_rx.clone();
            let registry = registry.clone();
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                broadcaster.worker_loop(worker_id, jobs_rx, registry).await;
            });
        }

        info!(
            "Broadcaster started: {} workers, queue capacity {}",
            config.workers, config.queue_capacity
        );
        broadcaster
    }

    /// Split a target set into independent jobs and enqueue them.
    ///
    /// Returns the number of jobs enqueued; the remainder were dropped
    /// against the backpressure timeout and counted.
    pub async fn enqueue(&self, targets: Vec<Arc<Connection>>, payload: String) -> usize {
        let shared: Arc<str> = payload.into();
        let mut enqueued = 0;

        for conn in targets {
            let job = Job {
                conn,
                payload: shared.clone(),
            };
            match self
                .jobs_tx
                .send_timeout(job, self.config.enqueue_timeout)
                .await
            {
                Ok(()) => {
                    self.in_flight.fetch_add(1, Ordering::Relaxed);
                    enqueued += 1;
                }
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("gateway_broadcast_dropped_total").increment(1);
                    warn!("Broadcast queue full, dropping job");
                }
            }
        }
        enqueued
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        jobs_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
        registry: Arc<ConnectionRegistry>,
    ) {
        debug!("Broadcast worker {} started", worker_id);
        loop {
            let job = {
                let mut rx = jobs_rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                debug!("Broadcast worker {} stopping", worker_id);
                break;
            };

            if job.conn.send_text(&job.payload) {
                self.sent.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_broadcast_sent_total").increment(1);
            } else {
                // A full buffer or a gone socket task both mean this client
                // is not draining; treat it as dead rather than retry.
                self.failed.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_broadcast_failed_total").increment(1);
                job.conn.close(close_code::GOING_AWAY, "write failed");
                registry.unregister(job.conn.id).await;
            }
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Wait for the queue to empty, up to `timeout`. Used on shutdown.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Broadcaster drain timed out with {} jobs in flight",
                    self.in_flight.load(Ordering::Relaxed)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{connection, registry};
    use crate::registry::DuplicatePolicy;
    use axum::extract::ws::Message;

    fn test_config() -> BroadcasterConfig {
        BroadcasterConfig {
            queue_capacity: 16,
            workers: 2,
            enqueue_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn delivers_to_every_target() {
        let reg = Arc::new(registry(DuplicatePolicy::Allow));
        let broadcaster = Broadcaster::start(test_config(), reg.clone());

        let (c1, mut rx1) = connection("t1", "u1", "waiter", "b1", None, None);
        let (c2, mut rx2) = connection("t1", "u2", "waiter", "b1", None, None);
        reg.register(c1.clone()).await.unwrap();
        reg.register(c2.clone()).await.unwrap();

        let enqueued = broadcaster
            .enqueue(vec![c1, c2], r#"{"type":"pong"}"#.to_string())
            .await;
        assert_eq!(enqueued, 2);

        for rx in [&mut rx1, &mut rx2] {
            let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(msg, Message::Text(t) if t.as_str().contains("pong")));
        }
        assert_eq!(broadcaster.sent_count(), 2);
    }

    #[tokio::test]
    async fn write_failure_unregisters_dead_connection() {
        let reg = Arc::new(registry(DuplicatePolicy::Allow));
        let broadcaster = Broadcaster::start(test_config(), reg.clone());

        let (dead, rx) = connection("t1", "u1", "waiter", "b1", None, None);
        reg.register(dead.clone()).await.unwrap();
        drop(rx); // socket task gone

        broadcaster
            .enqueue(vec![dead.clone()], "{}".to_string())
            .await;
        broadcaster.drain(Duration::from_secs(1)).await;

        assert_eq!(broadcaster.failed_count(), 1);
        assert_eq!(reg.count(), 0);
        // Not code 1000: the peer (if it ever comes back) should treat
        // this as an eviction and reconnect.
        assert_eq!(dead.close_reason().unwrap().code, close_code::GOING_AWAY);
    }

    #[tokio::test]
    async fn slow_connection_does_not_block_others() {
        let reg = Arc::new(registry(DuplicatePolicy::Allow));
        let broadcaster = Broadcaster::start(test_config(), reg.clone());

        // Slow client: tiny buffer, never drained.
        let (slow, _slow_rx) = {
            let (c, rx) = connection("t1", "slow", "waiter", "b1", None, None);
            // Fill its outbound buffer.
            while c.send_text("fill") {}
            (c, rx)
        };
        let (fast, mut fast_rx) = connection("t1", "fast", "waiter", "b1", None, None);
        reg.register(slow.clone()).await.unwrap();
        reg.register(fast.clone()).await.unwrap();

        broadcaster
            .enqueue(vec![slow, fast], "{}".to_string())
            .await;

        let msg = tokio::time::timeout(Duration::from_secs(1), fast_rx.recv())
            .await
            .unwrap();
        assert!(msg.is_some());
    }
}
