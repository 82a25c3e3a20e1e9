//! Ephemeral ingestion path: Redis pub/sub fan-in.
//!
//! At-most-once by design. Anything published while the gateway is
//! disconnected from the broker is lost on this path; it exists purely for
//! low-latency delivery of idempotent UI refresh events and is never the
//! sole channel for money or order state.

use crate::backoff::{next_backoff, with_jitter};
use crate::breaker::CircuitBreaker;
use crate::client::BrokerClient;
use crate::error::{BrokerError, Result};
use crate::sink::EventSink;
use common::Event;
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for the pub/sub subscriber.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Channel patterns to psubscribe to. Deployment configuration; the
    /// default covers the backend's event channels.
    pub patterns: Vec<String>,
    /// Initial reconnect delay.
    pub reconnect_delay: Duration,
    /// Cap for the exponential reconnect backoff.
    pub max_reconnect_delay: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            patterns: vec!["events:*".to_string()],
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Best-effort subscriber feeding the event sink.
pub struct EphemeralSubscriber<S: EventSink> {
    client: BrokerClient,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<S>,
    config: PubSubConfig,
}

impl<S: EventSink> EphemeralSubscriber<S> {
    pub fn new(
        client: BrokerClient,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<S>,
        config: PubSubConfig,
    ) -> Self {
        Self {
            client,
            breaker,
            sink,
            config,
        }
    }

    /// Run the subscriber until shutdown. Reconnects with capped
    /// exponential backoff whenever the subscription drops.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(
            "Starting ephemeral subscriber, patterns: {:?}",
            self.config.patterns
        );
        let mut delay = self.config.reconnect_delay;

        loop {
            let subscribe = self.breaker.call(|| self.subscribe()).await;
            let mut messages = match subscribe {
                Ok(stream) => {
                    delay = self.config.reconnect_delay;
                    stream
                }
                Err(BrokerError::CircuitOpen(_)) => {
                    // Fail fast, then wait out the recovery timeout.
                    if wait_or_shutdown(&mut shutdown_rx, with_jitter(delay)).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Pub/sub subscribe failed: {:?}", e);
                    if wait_or_shutdown(&mut shutdown_rx, with_jitter(delay)).await {
                        break;
                    }
                    delay = next_backoff(delay, self.config.max_reconnect_delay);
                    continue;
                }
            };

            info!("Pub/sub subscription established");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!("Ephemeral subscriber received shutdown signal");
                        return Ok(());
                    }

                    msg = messages.next() => {
                        match msg {
                            Some(msg) => self.handle_message(&msg).await,
                            None => {
                                warn!("Pub/sub connection dropped");
                                self.breaker.record_failure();
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Ephemeral subscriber stopped");
        Ok(())
    }

    async fn subscribe(&self) -> Result<impl futures::Stream<Item = redis::Msg>> {
        let mut pubsub = self.client.pubsub().await?;
        for pattern in &self.config.patterns {
            pubsub.psubscribe(pattern).await?;
        }
        Ok(pubsub.into_on_message())
    }

    async fn handle_message(&self, msg: &redis::Msg) {
        counter!("gateway_pubsub_received_total").increment(1);

        let event: Event = match serde_json::from_slice(msg.get_payload_bytes()) {
            Ok(event) => event,
            Err(e) => {
                counter!("gateway_pubsub_decode_errors_total").increment(1);
                warn!(
                    "Undecodable message on '{}': {}",
                    msg.get_channel_name(),
                    e
                );
                return;
            }
        };

        debug!(
            "Pub/sub event '{}' for tenant {}",
            event.event_type, event.tenant_id
        );

        // At-most-once: a failed delivery is counted, never retried.
        if let Err(e) = self.sink.deliver(event).await {
            counter!("gateway_pubsub_delivery_errors_total").increment(1);
            warn!("Pub/sub delivery failed: {}", e);
        }
    }
}

/// Sleep for `delay`, returning true if shutdown was signaled meanwhile.
async fn wait_or_shutdown(shutdown_rx: &mut mpsc::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
