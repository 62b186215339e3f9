// WorkKernel - shared infrastructure handed to every engine.
//
// Holds the connection pool, configuration, clock, metrics, and the
// post-commit event bus. Engines borrow it through an Arc and never own
// infrastructure themselves.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::config::Config;
use crate::metrics::Metrics;

use super::bus::EventBus;
use super::clock::{Clock, SystemClock};

pub struct WorkKernel {
    pub db: PgPool,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub bus: EventBus,
    pub metrics: Metrics,
}

impl WorkKernel {
    /// Production kernel with the system clock.
    pub fn new(db: PgPool, config: Config) -> Self {
        Self::with_clock(db, config, Arc::new(SystemClock))
    }

    /// Kernel with an injected clock (tests use `ManualClock`).
    pub fn with_clock(db: PgPool, config: Config, clock: Arc<dyn Clock>) -> Self {
        let metrics = Metrics::new(config.metrics_enabled, config.metrics_namespace.clone());
        Self {
            db,
            config,
            clock,
            bus: EventBus::new(),
            metrics,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
