//! Broker boundary for the event-distribution gateway.
//!
//! Two ingestion paths with deliberately different guarantees:
//!
//! - [`pubsub::EphemeralSubscriber`] — best-effort pub/sub fan-in.
//!   At-most-once, no redelivery, lowest latency.
//! - [`stream::DurableStreamConsumer`] — consumer-group reads off an
//!   append-only stream. At-least-once, pending-entry recovery after a
//!   crash, dead-letter stream for poison entries.
//!
//! Every broker call on either path goes through a [`breaker::CircuitBreaker`]
//! instance dedicated to that path, so an outage on one never blocks the
//! other.
//!
//! ```text
//! backend → broker ──pub/sub──→ EphemeralSubscriber ─┐
//!                 └──stream───→ DurableStreamConsumer ┴→ EventSink (gateway)
//! ```

pub mod backoff;
pub mod breaker;
pub mod client;
pub mod error;
pub mod pubsub;
pub mod sink;
pub mod stream;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use client::BrokerClient;
pub use error::{BrokerError, Result};
pub use pubsub::{EphemeralSubscriber, PubSubConfig};
pub use sink::EventSink;
pub use stream::{DurableStreamConsumer, StreamConsumerConfig, StreamOps};
