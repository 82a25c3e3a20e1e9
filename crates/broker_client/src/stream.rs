//! Durable ingestion path: consumer-group reads off an append-only stream.
//!
//! At-least-once: every entry is processed before it is acknowledged, so a
//! crash mid-batch only re-delivers the unacknowledged remainder. A
//! periodic recovery pass reclaims entries stuck in the group's pending
//! list, and entries that exhaust their delivery budget are appended to a
//! dead-letter stream and acked off the main one.

use crate::backoff::{next_backoff, with_jitter};
use crate::breaker::CircuitBreaker;
use crate::client::BrokerClient;
use crate::error::{BrokerError, Result};
use crate::sink::EventSink;
use async_trait::async_trait;
use common::Event;
use metrics::{counter, gauge};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Field under which the event JSON is stored in each stream entry.
const DATA_FIELD: &str = "data";

/// Configuration for the durable stream consumer.
#[derive(Debug, Clone)]
pub struct StreamConsumerConfig {
    /// Stream key to consume.
    pub stream: String,
    /// Consumer group name.
    pub group: String,
    /// This consumer's name within the group.
    pub consumer: String,
    /// Dead-letter stream key.
    pub dlq_stream: String,
    /// Entries per read call.
    pub batch_size: usize,
    /// XREADGROUP BLOCK timeout in milliseconds.
    pub block_ms: u64,
    /// How long an entry may sit unacknowledged in the pending list before
    /// the recovery pass reclaims it.
    pub claim_timeout: Duration,
    /// Run the recovery pass every N read cycles.
    pub recovery_every: u64,
    /// Deliveries before an entry is dead-lettered.
    pub max_deliveries: u32,
    /// Initial backoff after a broker error.
    pub initial_backoff: Duration,
    /// Backoff cap under sustained outage.
    pub max_backoff: Duration,
}

impl Default for StreamConsumerConfig {
    fn default() -> Self {
        Self {
            stream: "events:stream".to_string(),
            group: "gateway".to_string(),
            consumer: "gateway-1".to_string(),
            dlq_stream: "events:dlq".to_string(),
            batch_size: 32,
            block_ms: 5_000,
            claim_timeout: Duration::from_secs(60),
            recovery_every: 30,
            max_deliveries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl StreamConsumerConfig {
    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.stream.is_empty() {
            errors.push("stream cannot be empty".to_string());
        }
        if self.group.is_empty() {
            errors.push("group cannot be empty".to_string());
        }
        if self.consumer.is_empty() {
            errors.push("consumer cannot be empty".to_string());
        }
        if self.dlq_stream.is_empty() {
            errors.push("dlq_stream cannot be empty".to_string());
        }
        if self.dlq_stream == self.stream {
            errors.push("dlq_stream must differ from stream".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if self.max_deliveries == 0 {
            errors.push("max_deliveries must be positive".to_string());
        }
        if self.recovery_every == 0 {
            errors.push("recovery_every must be positive".to_string());
        }
        errors
    }
}

/// The stream commands the consumer issues, as a seam over the broker
/// connection. The delivery and recovery logic runs against this trait,
/// so it can be exercised without a live broker.
#[async_trait]
pub trait StreamOps: Clone + Send {
    /// XREADGROUP of fresh entries for this consumer.
    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<StreamReadReply>;

    /// XPENDING summary of the group's unacknowledged entries.
    async fn pending(
        &mut self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<StreamPendingCountReply>;

    /// XCLAIM one entry for this consumer.
    async fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: usize,
        id: &str,
    ) -> Result<StreamClaimReply>;

    /// XRANGE of exactly one id.
    async fn range_entry(&mut self, stream: &str, id: &str) -> Result<StreamRangeReply>;

    /// XADD with auto-assigned id.
    async fn append(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<()>;

    /// XACK one entry.
    async fn ack_entry(&mut self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// XGROUP CREATE MKSTREAM from the current tail. Succeeds if the
    /// group already exists.
    async fn create_group(&mut self, stream: &str, group: &str) -> Result<()>;
}

#[async_trait]
impl StreamOps for redis::aio::MultiplexedConnection {
    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<StreamReadReply> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        Ok(self.xread_options(&[stream], &[">"], &opts).await?)
    }

    async fn pending(
        &mut self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<StreamPendingCountReply> {
        Ok(self.xpending_count(stream, group, "-", "+", count).await?)
    }

    async fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: usize,
        id: &str,
    ) -> Result<StreamClaimReply> {
        Ok(self.xclaim(stream, group, consumer, min_idle_ms, &[id]).await?)
    }

    async fn range_entry(&mut self, stream: &str, id: &str) -> Result<StreamRangeReply> {
        Ok(self.xrange(stream, id, id).await?)
    }

    async fn append(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<()> {
        let _: String = self.xadd(stream, "*", fields).await?;
        Ok(())
    }

    async fn ack_entry(&mut self, stream: &str, group: &str, id: &str) -> Result<()> {
        let _: i64 = self.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn create_group(&mut self, stream: &str, group: &str) -> Result<()> {
        let created: redis::RedisResult<()> =
            self.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(()) => {
                info!("Created consumer group '{}' on '{}'", group, stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group '{}' already exists", group);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Guaranteed-delivery consumer feeding the event sink.
pub struct DurableStreamConsumer<S: EventSink> {
    client: BrokerClient,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<S>,
    config: StreamConsumerConfig,
}

impl<S: EventSink> DurableStreamConsumer<S> {
    pub fn new(
        client: BrokerClient,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<S>,
        config: StreamConsumerConfig,
    ) -> Self {
        Self {
            client,
            breaker,
            sink,
            config,
        }
    }

    /// Run the consumer until shutdown.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let errors = self.config.validate();
        if !errors.is_empty() {
            return Err(BrokerError::Config(errors.join("; ")));
        }

        info!(
            "Starting stream consumer '{}' on '{}' (group '{}')",
            self.config.consumer, self.config.stream, self.config.group
        );

        let mut conn_slot: Option<redis::aio::MultiplexedConnection> = None;
        let mut delay = self.config.initial_backoff;
        let mut cycles: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Stream consumer received shutdown signal");
                    break;
                }

                result = self.cycle(&mut conn_slot, &mut cycles) => {
                    match result {
                        Ok(()) => {
                            delay = self.config.initial_backoff;
                        }
                        Err(BrokerError::CircuitOpen(_)) => {
                            // Fail fast while open; probe again after a pause.
                            if wait_or_shutdown(&mut shutdown_rx, with_jitter(delay)).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Stream read failed: {:?}", e);
                            counter!("gateway_stream_errors_total").increment(1);
                            conn_slot = None;
                            if wait_or_shutdown(&mut shutdown_rx, with_jitter(delay)).await {
                                break;
                            }
                            delay = next_backoff(delay, self.config.max_backoff);
                        }
                    }
                }
            }
        }

        info!("Stream consumer stopped");
        Ok(())
    }

    /// One read cycle: optionally a recovery pass, then a blocking
    /// consumer-group read with per-entry processing and acks.
    async fn cycle(
        &self,
        conn_slot: &mut Option<redis::aio::MultiplexedConnection>,
        cycles: &mut u64,
    ) -> Result<()> {
        if conn_slot.is_none() {
            let mut conn = self
                .breaker
                .call(|| async move { self.client.connection().await })
                .await?;
            self.ensure_group(&mut conn).await?;
            *conn_slot = Some(conn);
        }
        let Some(conn) = conn_slot.as_mut() else {
            return Ok(());
        };

        *cycles += 1;
        if *cycles % self.config.recovery_every == 0 {
            self.recovery_pass(conn).await?;
        }

        let mut read_conn = conn.clone();
        let read = self
            .breaker
            .call(|| async move {
                read_conn
                    .read_group(
                        &self.config.stream,
                        &self.config.group,
                        &self.config.consumer,
                        self.config.batch_size,
                        self.config.block_ms as usize,
                    )
                    .await
            })
            .await;

        let reply = match read {
            Ok(reply) => reply,
            Err(BrokerError::Redis(e)) if e.code() == Some("NOGROUP") => {
                // Stream was trimmed or recreated underneath us; rebuild the
                // group from the current tail instead of crashing.
                warn!(
                    "Consumer group '{}' vanished, recreating",
                    self.config.group
                );
                self.ensure_group(conn).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for key in reply.keys {
            for entry in key.ids {
                counter!("gateway_stream_received_total").increment(1);
                self.process_entry(conn, &entry).await;
            }
        }

        Ok(())
    }

    /// Process one entry and acknowledge it on success. Processing happens
    /// strictly before the ack; a failed entry stays in the pending list for
    /// the recovery pass.
    async fn process_entry<C: StreamOps>(&self, conn: &mut C, entry: &StreamId) {
        match decode_entry(entry) {
            Ok(event) => {
                let tenant = event.tenant_id.clone();
                match self.sink.deliver(event).await {
                    Ok(()) => {
                        if let Err(e) = self.ack(conn, &entry.id).await {
                            warn!("Failed to ack {}: {:?}", entry.id, e);
                        } else {
                            counter!("gateway_stream_processed_total").increment(1);
                        }
                    }
                    Err(e) => {
                        counter!("gateway_stream_processing_errors_total").increment(1);
                        warn!(
                            "Processing failed for {} (tenant {}): {}",
                            entry.id, tenant, e
                        );
                    }
                }
            }
            Err(e) => {
                // An undecodable entry can never succeed; dead-letter it now
                // rather than grinding through the retry budget.
                warn!("Dead-lettering undecodable entry {}: {:?}", entry.id, e);
                let data: String = entry.get(DATA_FIELD).unwrap_or_default();
                if let Err(e) = self
                    .dead_letter(conn, &entry.id, &data, &e.to_string())
                    .await
                {
                    warn!("Failed to dead-letter {}: {:?}", entry.id, e);
                }
            }
        }
    }

    /// Reclaim entries stuck in the pending list past the claim timeout.
    ///
    /// Entries that already burned through their delivery budget go to the
    /// dead-letter stream; the rest are claimed by this consumer and
    /// re-processed. This is what lets the path survive a consumer crash
    /// without operator intervention.
    async fn recovery_pass<C: StreamOps>(&self, conn: &mut C) -> Result<()> {
        let mut pending_conn = conn.clone();
        let pending = self
            .breaker
            .call(|| async move {
                pending_conn
                    .pending(&self.config.stream, &self.config.group, self.config.batch_size)
                    .await
            })
            .await?;

        gauge!("gateway_stream_pending").set(pending.ids.len() as f64);

        let min_idle_ms = self.config.claim_timeout.as_millis() as usize;

        for p in pending.ids {
            if p.last_delivered_ms < min_idle_ms {
                continue;
            }

            if exceeded_delivery_budget(p.times_delivered as u64, self.config.max_deliveries) {
                self.dead_letter_pending(conn, &p.id).await?;
                continue;
            }

            let mut claim_conn = conn.clone();
            let entry_id = p.id.clone();
            let claimed = self
                .breaker
                .call(|| async move {
                    claim_conn
                        .claim(
                            &self.config.stream,
                            &self.config.group,
                            &self.config.consumer,
                            min_idle_ms,
                            &entry_id,
                        )
                        .await
                })
                .await?;

            counter!("gateway_stream_reclaimed_total").increment(claimed.ids.len() as u64);
            for entry in &claimed.ids {
                debug!("Re-delivering reclaimed entry {}", entry.id);
                self.process_entry(conn, entry).await;
            }
        }

        Ok(())
    }

    /// Move a pending entry past its retry budget to the dead-letter stream.
    async fn dead_letter_pending<C: StreamOps>(&self, conn: &mut C, id: &str) -> Result<()> {
        let mut range_conn = conn.clone();
        let range = self
            .breaker
            .call(|| async move { range_conn.range_entry(&self.config.stream, id).await })
            .await?;

        match range.ids.first() {
            Some(entry) => {
                let data: String = entry.get(DATA_FIELD).unwrap_or_default();
                self.dead_letter(conn, id, &data, "delivery budget exhausted")
                    .await?;
            }
            None => {
                // Entry was trimmed off the stream; nothing left to preserve.
                self.ack(conn, id).await?;
            }
        }
        Ok(())
    }

    /// Append to the dead-letter stream, then ack off the main stream.
    /// The record keeps the original id, payload, last error, and tenant so
    /// it stays retrievable for manual replay.
    async fn dead_letter<C: StreamOps>(
        &self,
        conn: &mut C,
        origin_id: &str,
        data: &str,
        error: &str,
    ) -> Result<()> {
        let tenant_id = serde_json::from_str::<Event>(data)
            .map(|e| e.tenant_id)
            .unwrap_or_default();

        let mut add_conn = conn.clone();
        let fields = [
            ("origin_id", origin_id),
            (DATA_FIELD, data),
            ("error", error),
            ("tenant_id", &tenant_id),
        ];
        self.breaker
            .call(|| async move { add_conn.append(&self.config.dlq_stream, &fields).await })
            .await?;
        self.ack(conn, origin_id).await?;

        counter!("gateway_stream_dlq_total").increment(1);
        warn!("Dead-lettered {}: {}", origin_id, error);
        Ok(())
    }

    async fn ack<C: StreamOps>(&self, conn: &mut C, id: &str) -> Result<()> {
        let mut ack_conn = conn.clone();
        self.breaker
            .call(|| async move {
                ack_conn
                    .ack_entry(&self.config.stream, &self.config.group, id)
                    .await
            })
            .await
    }

    /// Create the consumer group if it does not exist, starting from the
    /// current tail.
    async fn ensure_group<C: StreamOps>(&self, conn: &mut C) -> Result<()> {
        conn.create_group(&self.config.stream, &self.config.group)
            .await
    }
}

/// Whether an entry has been delivered at least `max_deliveries` times.
fn exceeded_delivery_budget(times_delivered: u64, max_deliveries: u32) -> bool {
    times_delivered >= max_deliveries as u64
}

/// Decode a stream entry into an event.
fn decode_entry(entry: &StreamId) -> Result<Event> {
    let data: String = entry
        .get(DATA_FIELD)
        .ok_or_else(|| BrokerError::MalformedEntry {
            id: entry.id.clone(),
            reason: format!("missing '{}' field", DATA_FIELD),
        })?;

    serde_json::from_str(&data).map_err(|e| BrokerError::MalformedEntry {
        id: entry.id.clone(),
        reason: e.to_string(),
    })
}

/// Sleep for `delay`, returning true if shutdown was signaled meanwhile.
async fn wait_or_shutdown(shutdown_rx: &mut mpsc::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
