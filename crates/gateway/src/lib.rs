//! Real-time event-distribution gateway.
//!
//! Sits between a transactional backend and many long-lived WebSocket
//! clients (floor staff, kitchen, dashboards) and delivers each domain
//! event to exactly the right set of connections.
//!
//! ## Architecture
//!
//! ```text
//! backend → Redis ──pub/sub──→ EphemeralSubscriber ─┐
//!                └──stream───→ DurableStreamConsumer ┴→ EventDispatcher
//!                                                           ↓
//!                                       EventRouter → ConnectionRegistry
//!                                                           ↓
//!                                        Broadcaster → client sockets
//! ```
//!
//! The registry is the only structure mutated by more than one component
//! (socket tasks, sweeper, revalidators); all its mutations go through the
//! lock manager under one fixed key order. A circuit breaker per ingestion
//! path keeps a broker outage from freezing the rest of the gateway.

pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod locks;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod sweeper;
pub mod ws_server;

pub use auth::{AuthConfig, AuthStrategy, Revalidator};
pub use broadcaster::{Broadcaster, BroadcasterConfig};
pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionId, ConnectionState, Scope};
pub use error::{GatewayError, Result};
pub use heartbeat::{HeartbeatConfig, HeartbeatTracker};
pub use locks::{LockKey, LockManager, LockManagerConfig};
pub use protocol::{ClientMessage, ServerMessage};
pub use rate_limit::{RateLimiter, RateLimiterConfig};
pub use registry::{ConnectionRegistry, DuplicatePolicy, RegistryConfig};
pub use router::{EventDispatcher, EventRouter};
pub use sweeper::{Sweeper, SweeperConfig};
pub use ws_server::{create_router, AppState};
