//! Control-plane configuration.
//!
//! Every knob is enumerated; numeric and boolean settings can be overridden
//! from environment variables, transition graphs programmatically.

use std::collections::HashSet;
use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::machine::{default_item_graph, default_order_graph, TransitionGraph};
use crate::model::states::{ItemState, OrderState};

/// Where lease rows live. The external variant keeps the same contract on a
/// keyed TTL store; only the db backend ships here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseBackend {
    #[default]
    Db,
    External,
}

/// Operations which refuse to run without a caller idempotency key.
pub fn default_required_operations() -> HashSet<String> {
    ["propose", "submit", "submit-part", "finalize", "approve", "reject"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    // Leases
    pub lease_ttl_seconds: i64,
    pub heartbeat_every_seconds: i64,
    pub lease_backend: LeaseBackend,

    // Retries
    pub default_max_attempts: i32,

    // Idempotency
    pub idempotency_required_operations: HashSet<String>,
    /// Header a transport binding should read the caller key from.
    pub idempotency_header_name: String,

    // State machine
    pub order_transitions: TransitionGraph<OrderState>,
    pub item_transitions: TransitionGraph<ItemState>,

    // Maintenance
    pub dead_letter_after_hours: i64,
    pub stale_order_threshold_hours: i64,
    pub enable_alerts: bool,

    // Metrics
    pub metrics_enabled: bool,
    pub metrics_namespace: String,

    // Query surface
    pub default_page_size: i64,
    pub max_page_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 600,
            heartbeat_every_seconds: 120,
            lease_backend: LeaseBackend::Db,
            default_max_attempts: 3,
            idempotency_required_operations: default_required_operations(),
            idempotency_header_name: "Idempotency-Key".to_string(),
            order_transitions: default_order_graph(),
            item_transitions: default_item_graph(),
            dead_letter_after_hours: 48,
            stale_order_threshold_hours: 24,
            enable_alerts: false,
            metrics_enabled: true,
            metrics_namespace: "work_orders".to_string(),
            default_page_size: 50,
            max_page_size: 100,
        }
    }
}

impl Config {
    /// Load configuration, overriding defaults from the environment.
    pub fn from_env() -> Result<Self> {
        // Load .env if present (development)
        let _ = dotenv();

        let mut config = Config::default();
        config.lease_ttl_seconds = env_i64("WORK_LEASE_TTL_SECONDS", config.lease_ttl_seconds)?;
        config.heartbeat_every_seconds = env_i64(
            "WORK_LEASE_HEARTBEAT_EVERY_SECONDS",
            config.heartbeat_every_seconds,
        )?;
        config.default_max_attempts = env_i64(
            "WORK_RETRY_DEFAULT_MAX_ATTEMPTS",
            config.default_max_attempts as i64,
        )? as i32;
        config.dead_letter_after_hours = env_i64(
            "WORK_MAINTENANCE_DEAD_LETTER_AFTER_HOURS",
            config.dead_letter_after_hours,
        )?;
        config.stale_order_threshold_hours = env_i64(
            "WORK_MAINTENANCE_STALE_ORDER_THRESHOLD_HOURS",
            config.stale_order_threshold_hours,
        )?;
        config.enable_alerts = env_bool("WORK_MAINTENANCE_ENABLE_ALERTS", config.enable_alerts)?;
        if let Ok(header) = env::var("WORK_IDEMPOTENCY_HEADER_NAME") {
            config.idempotency_header_name = header;
        }
        config.metrics_enabled = env_bool("WORK_METRICS_ENABLED", config.metrics_enabled)?;
        if let Ok(namespace) = env::var("WORK_METRICS_NAMESPACE") {
            config.metrics_namespace = namespace;
        }
        config.default_page_size =
            env_i64("WORK_QUERY_DEFAULT_PAGE_SIZE", config.default_page_size)?;
        config.max_page_size = env_i64("WORK_QUERY_MAX_PAGE_SIZE", config.max_page_size)?;
        if let Ok(backend) = env::var("WORK_LEASE_BACKEND") {
            config.lease_backend = match backend.as_str() {
                "db" => LeaseBackend::Db,
                "external" => LeaseBackend::External,
                other => anyhow::bail!("WORK_LEASE_BACKEND must be db or external, got {other}"),
            };
        }

        Ok(config)
    }

    pub fn requires_idempotency_key(&self, operation: &str) -> bool {
        self.idempotency_required_operations.contains(operation)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_seconds)
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("{name} must be an integer")),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => anyhow::bail!("{name} must be a boolean, got {other}"),
        },
        Err(_) => Ok(default),
    }
}
