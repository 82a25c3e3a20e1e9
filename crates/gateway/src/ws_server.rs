//! WebSocket server handler using Axum.
//!
//! Handshake: the client presents a staff token or a table token as a
//! query parameter, plus the scope it wants events for. Authentication and
//! origin checks run before the registry sees the connection; failures
//! still complete the upgrade so the client receives an explicit close
//! code instead of an opaque HTTP rejection.

use crate::auth::{check_origin, AuthStrategy};
use crate::config::GatewayConfig;
use crate::connection::{Connection, Scope, OUTBOUND_BUFFER};
use crate::error::{GatewayError, Result};
use crate::protocol::{close_code, ClientMessage, ServerMessage};
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Inbound frames larger than this are rejected with close code 1009.
const MAX_INBOUND_FRAME: usize = 64 * 1024;

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub rate_limiter: RateLimiter,
    pub staff_auth: AuthStrategy,
    pub table_auth: AuthStrategy,
    pub config: GatewayConfig,
}

/// Handshake query parameters.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Staff credential.
    pub token: Option<String>,
    /// Table-presence credential.
    pub table_token: Option<String>,
    pub branch_id: Option<String>,
    pub sector_id: Option<String>,
    pub session_id: Option<String>,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","connections":{}}}"#,
        state.registry.count()
    )
}

/// WebSocket upgrade handler.
///
/// The credential is resolved before the upgrade; the outcome rides into
/// `handle_socket` so a failure becomes a close frame with a code the
/// client can branch on.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let admission = admit(&state, &query, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, admission))
}

/// Resolve the handshake into a credential check outcome.
fn admit(state: &AppState, query: &WsQuery, headers: &HeaderMap) -> Result<(Connection, mpsc::Receiver<Message>)> {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    check_origin(origin, &state.config.auth)?;

    // Staff credentials may also arrive as a bearer header.
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from);

    let (identity, retained_token, session_binding) = match (&query.token, &query.table_token, bearer)
    {
        (Some(token), _, _) => (state.staff_auth.authenticate(token)?, token.clone(), None),
        (None, Some(token), _) => {
            let identity = state.table_auth.authenticate(token)?;
            let binding = state.table_auth.session_binding(token)?;
            (identity, token.clone(), binding)
        }
        (None, None, Some(token)) => (state.staff_auth.authenticate(&token)?, token, None),
        (None, None, None) => {
            return Err(GatewayError::Auth("missing credential".to_string()));
        }
    };

    // Tables are pinned to their token's branch; staff pick a branch they
    // are entitled to.
    let branch_id = match &query.branch_id {
        Some(branch) => branch.clone(),
        None => identity
            .branch_ids
            .first()
            .cloned()
            .ok_or_else(|| GatewayError::Auth("credential carries no branch".to_string()))?,
    };
    if !identity.can_access_branch(&branch_id) {
        return Err(GatewayError::Forbidden(format!(
            "branch {} not in credential scope",
            branch_id
        )));
    }

    // A table token bound to a session only ever sees that session,
    // no matter what the query asks for.
    let session_id = match (session_binding, &query.session_id) {
        (Some(bound), Some(requested)) if requested != &bound => {
            return Err(GatewayError::Forbidden(format!(
                "session {} not in credential scope",
                requested
            )));
        }
        (Some(bound), _) => Some(bound),
        (None, requested) => requested.clone(),
    };

    let scope = Scope {
        branch_id,
        sector_id: query.sector_id.clone(),
        session_id,
    };
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    Ok((Connection::new(identity, scope, retained_token, tx), rx))
}

/// Handle one accepted socket for its whole lifetime.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    admission: Result<(Connection, mpsc::Receiver<Message>)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (conn, rx) = match admission {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Handshake rejected: {}", e);
            counter!("gateway_handshake_rejections_total").increment(1);
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: e.close_code(),
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let conn = Arc::new(conn);
    let evicted = match state.registry.register(conn.clone()).await {
        Ok(evicted) => evicted,
        Err(e) => {
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: e.close_code(),
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };
    for old in evicted {
        old.close(close_code::GOING_AWAY, "replaced by newer connection");
    }

    counter!("gateway_connections_total").increment(1);
    info!(
        "Connection {} established (tenant {}, subject {}, branch {})",
        conn.id, conn.identity.tenant_id, conn.identity.subject_id, conn.scope.branch_id
    );

    // Forward the outbound channel to the socket sink. The channel is the
    // only write path; the broadcaster and the read loop both go through it.
    let forward = tokio::spawn(forward_outbound(rx, ws_tx));

    let mut ping_interval = interval(state.config.heartbeat.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the ping cadence starts
    // one interval after connect.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = conn.closed() => {
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_frame(&state, &conn, msg) {
                            warn!("Connection {}: {}", conn.id, e);
                            match e {
                                GatewayError::RateLimited => {
                                    counter!("gateway_rate_limit_rejections_total").increment(1);
                                    conn.close(close_code::RATE_LIMITED, "message budget exceeded");
                                }
                                GatewayError::MessageTooLarge => {
                                    conn.close(close_code::MESSAGE_TOO_LARGE, "frame too large");
                                }
                                // Malformed frames are answered, not fatal.
                                _ => {
                                    let _ = send_server_message(&conn, &ServerMessage::Error {
                                        message: e.to_string(),
                                        code: "BAD_MESSAGE".to_string(),
                                    });
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Socket error on {}: {}", conn.id, e);
                        conn.close(close_code::NORMAL, "socket error");
                    }
                    None => {
                        conn.close(close_code::NORMAL, "client closed");
                    }
                }
            }

            _ = ping_interval.tick() => {
                if !conn.enqueue(Message::Ping(Vec::new().into())) {
                    conn.close(close_code::NORMAL, "outbound buffer stalled");
                }
            }
        }
    }

    state.registry.unregister(conn.id).await;

    // Deliver the close frame through the forwarder so queued frames go
    // out first, then drop the channel to end the forwarder task.
    if let Some(reason) = conn.close_reason() {
        let _ = conn.enqueue(Message::Close(Some(CloseFrame {
            code: reason.code,
            reason: reason.reason.into(),
        })));
    }
    drop(conn);
    let _ = forward.await;

    counter!("gateway_disconnections_total").increment(1);
}

async fn forward_outbound(
    mut rx: mpsc::Receiver<Message>,
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if ws_tx.send(msg).await.is_err() || is_close {
            break;
        }
    }
}

/// Handle a single inbound frame.
fn handle_frame(state: &AppState, conn: &Arc<Connection>, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => {
            if text.len() > MAX_INBOUND_FRAME {
                return Err(GatewayError::MessageTooLarge);
            }
            if !state.rate_limiter.allow(&conn.budget) {
                return Err(GatewayError::RateLimited);
            }
            let client_msg: ClientMessage = serde_json::from_str(&text)?;
            match client_msg {
                ClientMessage::Ping => {
                    conn.record_pong();
                    send_server_message(conn, &ServerMessage::Pong)?;
                }
            }
            Ok(())
        }
        Message::Pong(_) => {
            conn.record_pong();
            Ok(())
        }
        Message::Ping(data) => {
            // Protocol-level pings are answered and count as liveness.
            conn.record_pong();
            conn.enqueue(Message::Pong(data));
            Ok(())
        }
        Message::Binary(_) => Err(GatewayError::Auth("binary frames unsupported".to_string())),
        Message::Close(_) => {
            conn.close(close_code::NORMAL, "client closed");
            Ok(())
        }
    }
}

fn send_server_message(conn: &Arc<Connection>, msg: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    if conn.send_text(&json) {
        Ok(())
    } else {
        Err(GatewayError::ChannelSend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::heartbeat::HeartbeatConfig;
    use crate::locks::LockManager;
    use crate::rate_limit::RateLimiterConfig;
    use crate::registry::RegistryConfig;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn auth_config() -> AuthConfig {
        AuthConfig {
            staff_secret: "staff-secret".to_string(),
            table_secret: "table-secret".to_string(),
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..AuthConfig::default()
        }
    }

    fn test_state() -> AppState {
        let auth = auth_config();
        let config = GatewayConfig {
            redis_url: "redis://localhost:6379".to_string(),
            http_port: 0,
            metrics_port: 0,
            auth: auth.clone(),
            registry: RegistryConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            broadcaster: crate::broadcaster::BroadcasterConfig::default(),
            sweeper: crate::sweeper::SweeperConfig::default(),
            pubsub: broker_client::PubSubConfig::default(),
            stream: broker_client::StreamConsumerConfig::default(),
        };
        AppState {
            registry: Arc::new(ConnectionRegistry::new(
                Arc::new(LockManager::with_defaults()),
                RegistryConfig::default(),
            )),
            rate_limiter: RateLimiter::new(RateLimiterConfig::default()),
            staff_auth: AuthStrategy::staff(&auth),
            table_auth: AuthStrategy::table_presence(&auth),
            config,
        }
    }

    fn staff_token(branches: &[&str]) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = crate::auth::StaffClaims {
            sub: "u1".to_string(),
            tid: "t1".to_string(),
            role: "waiter".to_string(),
            branches: branches.iter().map(|b| b.to_string()).collect(),
            exp: now + 3600,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"staff-secret"),
        )
        .unwrap()
    }

    fn table_token(session_id: Option<&str>) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = crate::auth::TableClaims {
            sub: "table-7".to_string(),
            tid: "t1".to_string(),
            branch: "b1".to_string(),
            session_id: session_id.map(String::from),
            exp: now + 3600,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"table-secret"),
        )
        .unwrap()
    }

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("origin", origin.parse().unwrap());
        headers
    }

    fn query(token: Option<String>, branch: Option<&str>) -> WsQuery {
        WsQuery {
            token,
            table_token: None,
            branch_id: branch.map(String::from),
            sector_id: None,
            session_id: None,
        }
    }

    #[test]
    fn admit_accepts_valid_staff_handshake() {
        let state = test_state();
        let (conn, _rx) = admit(
            &state,
            &query(Some(staff_token(&["b1", "b2"])), Some("b2")),
            &headers_with_origin("https://app.example.com"),
        )
        .unwrap();
        assert_eq!(conn.identity.subject_id, "u1");
        assert_eq!(conn.scope.branch_id, "b2");
    }

    #[test]
    fn admit_defaults_to_first_entitled_branch() {
        let state = test_state();
        let (conn, _rx) = admit(
            &state,
            &query(Some(staff_token(&["b1", "b2"])), None),
            &headers_with_origin("https://app.example.com"),
        )
        .unwrap();
        assert_eq!(conn.scope.branch_id, "b1");
    }

    #[test]
    fn admit_rejects_branch_outside_credential() {
        let state = test_state();
        let err = admit(
            &state,
            &query(Some(staff_token(&["b1"])), Some("b9")),
            &headers_with_origin("https://app.example.com"),
        )
        .unwrap_err();
        assert_eq!(err.close_code(), close_code::FORBIDDEN);
    }

    #[test]
    fn admit_rejects_bad_origin_before_credential_check() {
        let state = test_state();
        let err = admit(
            &state,
            &query(Some(staff_token(&["b1"])), Some("b1")),
            &headers_with_origin("https://evil.example.com"),
        )
        .unwrap_err();
        assert_eq!(err.close_code(), close_code::POLICY_VIOLATION);
    }

    #[test]
    fn admit_accepts_bearer_header_for_staff() {
        let state = test_state();
        let mut headers = headers_with_origin("https://app.example.com");
        headers.insert(
            "authorization",
            format!("Bearer {}", staff_token(&["b1"])).parse().unwrap(),
        );
        let (conn, _rx) = admit(&state, &query(None, Some("b1")), &headers).unwrap();
        assert_eq!(conn.identity.subject_id, "u1");
    }

    #[test]
    fn admit_pins_table_scope_to_token_session() {
        let state = test_state();
        // Query asks for no session; the binding still lands in the scope.
        let q = WsQuery {
            token: None,
            table_token: Some(table_token(Some("sess-42"))),
            branch_id: None,
            sector_id: None,
            session_id: None,
        };
        let (conn, _rx) = admit(&state, &q, &headers_with_origin("https://app.example.com")).unwrap();
        assert_eq!(conn.scope.session_id.as_deref(), Some("sess-42"));
        assert_eq!(conn.scope.branch_id, "b1");
    }

    #[test]
    fn admit_rejects_table_session_outside_credential() {
        let state = test_state();
        let q = WsQuery {
            token: None,
            table_token: Some(table_token(Some("sess-42"))),
            branch_id: None,
            sector_id: None,
            session_id: Some("sess-99".to_string()),
        };
        let err = admit(&state, &q, &headers_with_origin("https://app.example.com")).unwrap_err();
        assert_eq!(err.close_code(), close_code::FORBIDDEN);
    }

    #[test]
    fn admit_rejects_missing_credential() {
        let state = test_state();
        let err = admit(
            &state,
            &query(None, Some("b1")),
            &headers_with_origin("https://app.example.com"),
        )
        .unwrap_err();
        assert_eq!(err.close_code(), close_code::AUTH_FAILED);
    }
}
