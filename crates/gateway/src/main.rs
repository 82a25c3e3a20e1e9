//! Gateway service entry point.
//!
//! Real-time event-distribution gateway: WebSocket fan-out of backend
//! domain events to floor staff, kitchen, and table clients.

use anyhow::Result;
use broker_client::{
    BrokerClient, CircuitBreaker, DurableStreamConsumer, EphemeralSubscriber,
};
use gateway::{
    create_router, AppState, AuthStrategy, Broadcaster, ConnectionRegistry, EventDispatcher,
    EventRouter, GatewayConfig, HeartbeatTracker, LockManager, RateLimiter, Revalidator, Sweeper,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting event gateway");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  REDIS_URL: {}", config.redis_url);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  EVENT_STREAM: {}", config.stream.stream);
    info!("  CONSUMER_GROUP: {}", config.stream.group);
    info!("  PUBSUB_PATTERNS: {:?}", config.pubsub.patterns);
    info!("  DUPLICATE_POLICY: {:?}", config.registry.duplicate_policy);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Connect to the broker; a dead broker at startup is fatal, an outage
    // later is the circuit breakers' problem.
    let broker = BrokerClient::new(&config.redis_url)?;
    broker.ping().await?;
    info!("Connected to broker at {}", config.redis_url);

    // Core components
    let locks = Arc::new(LockManager::with_defaults());
    let registry = Arc::new(ConnectionRegistry::new(locks, config.registry.clone()));
    let broadcaster = Broadcaster::start(config.broadcaster.clone(), registry.clone());
    let dispatcher = Arc::new(EventDispatcher::new(
        EventRouter::new(registry.clone()),
        broadcaster.clone(),
    ));

    // Ingestion paths, one breaker each so an outage on one path never
    // blocks the other.
    let stream_breaker = Arc::new(CircuitBreaker::with_defaults("stream"));
    let pubsub_breaker = Arc::new(CircuitBreaker::with_defaults("pubsub"));

    let (stream_shutdown_tx, stream_shutdown_rx) = mpsc::channel(1);
    let stream_consumer = DurableStreamConsumer::new(
        broker.clone(),
        stream_breaker,
        dispatcher.clone(),
        config.stream.clone(),
    );
    let stream_handle = tokio::spawn(async move {
        if let Err(e) = stream_consumer.run(stream_shutdown_rx).await {
            error!("Stream consumer error: {:?}", e);
        }
    });

    let (pubsub_shutdown_tx, pubsub_shutdown_rx) = mpsc::channel(1);
    let pubsub_subscriber = EphemeralSubscriber::new(
        broker.clone(),
        pubsub_breaker,
        dispatcher.clone(),
        config.pubsub.clone(),
    );
    let pubsub_handle = tokio::spawn(async move {
        if let Err(e) = pubsub_subscriber.run(pubsub_shutdown_rx).await {
            error!("Ephemeral subscriber error: {:?}", e);
        }
    });

    // Background maintenance
    let (sweeper_shutdown_tx, sweeper_shutdown_rx) = mpsc::channel(1);
    let sweeper = Sweeper::new(
        registry.clone(),
        HeartbeatTracker::new(config.heartbeat.clone()),
        config.sweeper.clone(),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(sweeper_shutdown_rx));

    let (staff_reval_tx, staff_reval_rx) = mpsc::channel(1);
    let staff_revalidator = Revalidator::new(
        registry.clone(),
        AuthStrategy::staff(&config.auth),
        config.auth.staff_revalidate_after,
    );
    let staff_reval_handle = tokio::spawn(staff_revalidator.run(staff_reval_rx));

    let (table_reval_tx, table_reval_rx) = mpsc::channel(1);
    let table_revalidator = Revalidator::new(
        registry.clone(),
        AuthStrategy::table_presence(&config.auth),
        config.auth.table_revalidate_after,
    );
    let table_reval_handle = tokio::spawn(table_revalidator.run(table_reval_rx));

    // HTTP server
    let state = Arc::new(AppState {
        registry: registry.clone(),
        rate_limiter: RateLimiter::new(config.rate_limit.clone()),
        staff_auth: AuthStrategy::staff(&config.auth),
        table_auth: AuthStrategy::table_presence(&config.auth),
        config: config.clone(),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop ingestion first so no new events enter the pipeline, drain the
    // broadcaster, then close the remaining clients with 1001.
    info!("Shutting down ingestion paths...");
    let _ = stream_shutdown_tx.send(()).await;
    let _ = pubsub_shutdown_tx.send(()).await;
    let _ = stream_handle.await;
    let _ = pubsub_handle.await;

    broadcaster.drain(std::time::Duration::from_secs(5)).await;

    let _ = sweeper_shutdown_tx.send(()).await;
    let _ = staff_reval_tx.send(()).await;
    let _ = table_reval_tx.send(()).await;
    let _ = sweeper_handle.await;
    let _ = staff_reval_handle.await;
    let _ = table_reval_handle.await;

    for conn in registry.snapshot() {
        conn.close(gateway::protocol::close_code::GOING_AWAY, "server shutdown");
        registry.unregister(conn.id).await;
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
