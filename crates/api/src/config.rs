//! Application configuration loaded from environment variables.

use std::collections::HashMap;
use std::time::Duration;

use relay::RelayConfig;
use saga::order_processing;

/// Server and engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `DATABASE_URL` — PostgreSQL connection string (default: `None`, uses in-memory store)
/// - `DB_MAX_CONNECTIONS` — max database pool connections (default: `10`)
/// - `DISPATCHER_WORKERS` — delivery worker count (default: `8`)
/// - `DISPATCHER_QUEUE_DEPTH` — per-worker queue bound (default: `256`)
/// - `OUTBOX_POLL_INTERVAL_SECS` — relay poll interval (default: `5`)
/// - `OUTBOX_BATCH_SIZE` — rows claimed per poll (default: `50`)
/// - `OUTBOX_MAX_RETRIES` — publish attempts before dead-letter (default: `5`)
/// - `ORDER_CREATED_URL` / `ORDER_PROCESSED_URL` / `ORDER_SHIPPED_URL` —
///   step endpoints (default: localhost mock ports)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub dispatcher_workers: usize,
    pub dispatcher_queue_depth: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_max_retries: u32,
    /// Step name → endpoint URL for the reference workflow.
    pub step_endpoints: HashMap<String, String>,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let step_endpoints = HashMap::from([
            (
                order_processing::STEP_CREATE_ORDER.to_string(),
                std::env::var("ORDER_CREATED_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8081/orders".to_string()),
            ),
            (
                order_processing::STEP_PROCESS_ORDER.to_string(),
                std::env::var("ORDER_PROCESSED_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8082/payments".to_string()),
            ),
            (
                order_processing::STEP_SHIP_ORDER.to_string(),
                std::env::var("ORDER_SHIPPED_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8083/shipments".to_string()),
            ),
        ]);

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parsed("PORT", 3000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: env_parsed("DB_MAX_CONNECTIONS", 10),
            dispatcher_workers: env_parsed("DISPATCHER_WORKERS", 8),
            dispatcher_queue_depth: env_parsed("DISPATCHER_QUEUE_DEPTH", 256),
            outbox_poll_interval: Duration::from_secs(env_parsed("OUTBOX_POLL_INTERVAL_SECS", 5)),
            outbox_batch_size: env_parsed("OUTBOX_BATCH_SIZE", 50),
            outbox_max_retries: env_parsed("OUTBOX_MAX_RETRIES", 5),
            step_endpoints,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Relay configuration derived from the outbox settings.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: self.outbox_poll_interval,
            batch_size: self.outbox_batch_size,
            max_retries: self.outbox_max_retries,
            ..RelayConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            db_max_connections: 10,
            dispatcher_workers: 8,
            dispatcher_queue_depth: 256,
            outbox_poll_interval: Duration::from_secs(5),
            outbox_batch_size: 50,
            outbox_max_retries: 5,
            step_endpoints: HashMap::new(),
        }
    }
}
