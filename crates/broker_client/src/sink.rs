//! Delivery seam between the ingestion paths and the gateway.

use async_trait::async_trait;
use common::Event;

/// Consumer of decoded events, implemented by the gateway's dispatcher.
///
/// Both ingestion paths call `deliver` sequentially from their own task, so
/// relative order is preserved per path (never across paths).
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Process one event end to end (resolve targets, enqueue sends).
    ///
    /// An `Err` means processing failed in a way worth retrying; on the
    /// durable path the message is then left unacknowledged. Events that
    /// are invalid rather than transiently unprocessable should be dropped
    /// inside the sink (with a counted metric) and reported as `Ok`.
    async fn deliver(&self, event: Event) -> Result<(), String>;
}
