//! Per-connection state.
//!
//! A `Connection` exclusively owns its socket: the socket task forwards
//! whatever arrives on the connection's outbound channel, and no other
//! component writes to the socket directly.

use crate::rate_limit::MessageBudget;
use axum::extract::ws::Message;
use chrono::Utc;
use common::Identity;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Unique, process-local connection identifier.
pub type ConnectionId = Uuid;

/// Outbound buffer per connection. A client that cannot drain this is
/// treated as dead by the broadcaster.
pub const OUTBOUND_BUFFER: usize = 256;

/// Connection lifecycle state.
///
/// A connection is indexed in the registry iff it is `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticated = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticated,
            2 => ConnectionState::Active,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Event scope a connection is subscribed to, derived at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub branch_id: String,
    pub sector_id: Option<String>,
    pub session_id: Option<String>,
}

/// Why a connection is being closed, surfaced as a WebSocket close frame.
#[derive(Debug, Clone, Copy)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

/// State for a single accepted socket.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Immutable identity resolved by the auth strategy.
    pub identity: Identity,
    /// Scope used for event routing.
    pub scope: Scope,
    /// Raw credential, retained for periodic revalidation.
    pub token: String,
    /// Per-connection message budget (fixed window).
    pub budget: MessageBudget,
    /// Channel to the socket task that owns the actual sink.
    tx: mpsc::Sender<Message>,
    state: AtomicU8,
    last_pong_ms: AtomicI64,
    last_revalidated_ms: AtomicI64,
    close_reason: Mutex<Option<CloseReason>>,
    closed: Notify,
    pub connected_at: i64,
}

impl Connection {
    pub fn new(identity: Identity, scope: Scope, token: String, tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            identity,
            scope,
            token,
            budget: MessageBudget::new(),
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_pong_ms: AtomicI64::new(now),
            last_revalidated_ms: AtomicI64::new(now),
            close_reason: Mutex::new(None),
            closed: Notify::new(),
            connected_at: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Record a pong (or application-level ping) from the client.
    pub fn record_pong(&self) {
        self.last_pong_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_pong_ms(&self) -> i64 {
        self.last_pong_ms.load(Ordering::Relaxed)
    }

    pub fn mark_revalidated(&self) {
        self.last_revalidated_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_revalidated_ms(&self) -> i64 {
        self.last_revalidated_ms.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue of an outbound frame.
    /// Returns false if the buffer is full or the socket task is gone.
    pub fn enqueue(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Enqueue a pre-serialized text frame.
    pub fn send_text(&self, payload: &str) -> bool {
        self.enqueue(Message::Text(payload.to_string().into()))
    }

    /// Request this connection be closed with an explicit code.
    ///
    /// Idempotent: the first reason wins. The socket task observes the
    /// signal, sends the close frame, and tears the connection down.
    pub fn close(&self, code: u16, reason: &'static str) {
        {
            let mut slot = self.close_reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(CloseReason { code, reason });
            }
        }
        self.set_state(ConnectionState::Closing);
        self.closed.notify_one();
    }

    /// Wait until [`close`](Self::close) is called.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }
}
