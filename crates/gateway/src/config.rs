//! Gateway configuration, read from the environment at startup.

use crate::auth::AuthConfig;
use crate::broadcaster::BroadcasterConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::rate_limit::RateLimiterConfig;
use crate::registry::{DuplicatePolicy, RegistryConfig};
use crate::sweeper::SweeperConfig;
use anyhow::{anyhow, Context, Result};
use broker_client::{PubSubConfig, StreamConsumerConfig};
use std::env;
use std::time::Duration;

/// Complete gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    pub redis_url: String,
    pub http_port: u16,
    pub metrics_port: u16,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
    pub rate_limit: RateLimiterConfig,
    pub heartbeat: HeartbeatConfig,
    pub broadcaster: BroadcasterConfig,
    pub sweeper: SweeperConfig,
    pub pubsub: PubSubConfig,
    pub stream: StreamConsumerConfig,
}

impl GatewayConfig {
    /// Read configuration from the environment.
    ///
    /// Missing secrets are fatal; everything else has a default. Invalid
    /// numbers fail here rather than surfacing later as a misbehaving
    /// limit.
    pub fn from_env() -> Result<Self> {
        let staff_secret =
            env::var("STAFF_JWT_SECRET").map_err(|_| anyhow!("STAFF_JWT_SECRET must be set"))?;
        let table_secret =
            env::var("TABLE_JWT_SECRET").map_err(|_| anyhow!("TABLE_JWT_SECRET must be set"))?;

        let auth = AuthConfig {
            staff_secret,
            table_secret,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            allow_any_origin: env_bool("ALLOW_ANY_ORIGIN", false),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "production".to_string()),
            staff_revalidate_after: env_secs("STAFF_REVALIDATE_SECS", 5 * 60)?,
            table_revalidate_after: env_secs("TABLE_REVALIDATE_SECS", 30 * 60)?,
        };

        let registry = RegistryConfig {
            duplicate_policy: env::var("DUPLICATE_POLICY")
                .unwrap_or_else(|_| "allow".to_string())
                .parse::<DuplicatePolicy>()
                .map_err(|e| anyhow!(e))?,
        };

        let rate_limit = RateLimiterConfig {
            budget: env_parse("RATE_LIMIT_BUDGET", 20)?,
            window: Duration::from_secs(1),
        };

        let heartbeat = HeartbeatConfig {
            ping_interval: env_secs("PING_INTERVAL_SECS", 30)?,
            pong_window: env_secs("PONG_WINDOW_SECS", 10)?,
            missed_limit: env_parse("MISSED_PONG_LIMIT", 3)?,
        };

        let broadcaster = BroadcasterConfig {
            queue_capacity: env_parse("BROADCAST_QUEUE_CAPACITY", 5_000)?,
            workers: env_parse("BROADCAST_WORKERS", 10)?,
            enqueue_timeout: Duration::from_millis(env_parse("BROADCAST_ENQUEUE_TIMEOUT_MS", 100)?),
        };

        let sweeper = SweeperConfig {
            interval: env_secs("SWEEP_INTERVAL_SECS", 10)?,
            max_evictions: env_parse("SWEEP_MAX_EVICTIONS", 500)?,
        };

        let pubsub = PubSubConfig {
            patterns: env::var("PUBSUB_PATTERNS")
                .unwrap_or_else(|_| "events:*".to_string())
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            ..PubSubConfig::default()
        };

        let stream = StreamConsumerConfig {
            stream: env::var("EVENT_STREAM").unwrap_or_else(|_| "events:stream".to_string()),
            group: env::var("CONSUMER_GROUP").unwrap_or_else(|_| "gateway".to_string()),
            consumer: env::var("CONSUMER_NAME").unwrap_or_else(|_| "gateway-1".to_string()),
            dlq_stream: env::var("DLQ_STREAM").unwrap_or_else(|_| "events:dlq".to_string()),
            max_deliveries: env_parse("STREAM_MAX_DELIVERIES", 3)?,
            ..StreamConsumerConfig::default()
        };
        let problems = stream.validate();
        if !problems.is_empty() {
            return Err(anyhow!("invalid stream config: {}", problems.join("; ")));
        }

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            http_port: env_parse("HTTP_PORT", 8082)?,
            metrics_port: env_parse("METRICS_PORT", 9093)?,
            auth,
            registry,
            rate_limit,
            heartbeat,
            broadcaster,
            sweeper,
            pubsub,
            stream,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(name, default_secs)?))
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}
