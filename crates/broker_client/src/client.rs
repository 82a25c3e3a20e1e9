//! Shared Redis client wrapper used by both ingestion paths.

use crate::error::Result;
use tracing::info;

/// Thin wrapper around [`redis::Client`] handing out connections for the
/// pub/sub and stream paths.
#[derive(Clone)]
pub struct BrokerClient {
    client: redis::Client,
}

impl BrokerClient {
    /// Create a new broker client. Does not connect yet; connections are
    /// established lazily by each path.
    pub fn new(broker_url: &str) -> Result<Self> {
        let client = redis::Client::open(broker_url)?;
        Ok(Self { client })
    }

    /// Get a multiplexed async connection for command traffic
    /// (stream reads, acks, dead-letter appends).
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Open a dedicated pub/sub connection.
    ///
    /// Pub/sub needs its own connection: a subscribed Redis connection
    /// cannot issue regular commands.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        let pubsub = self.client.get_async_pubsub().await?;
        Ok(pubsub)
    }

    /// Verify the broker is reachable. Used once at startup so a bad URL
    /// fails the process instead of looping in backoff.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        info!("Broker reachable");
        Ok(())
    }
}
