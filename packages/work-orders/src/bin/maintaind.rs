//! Maintenance daemon: runs the reclaim / dead-letter / stale sweeps on an
//! interval until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

use work_orders_core::maintainer::MaintenanceFlags;
use work_orders_core::registry::EchoOrderType;
use work_orders_core::{Config, TypeRegistry, WorkKernel, WorkService};

const TICK_SECONDS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;

    let kernel = Arc::new(WorkKernel::new(pool, config));
    let mut registry = TypeRegistry::new();
    registry.register(Arc::new(EchoOrderType::new()));
    let service = WorkService::new(kernel, Arc::new(registry));

    tracing::info!(tick_seconds = TICK_SECONDS, "maintenance daemon starting");

    let mut interval = tokio::time::interval(Duration::from_secs(TICK_SECONDS));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                if let Err(error) = service.maintain(MaintenanceFlags::default()).await {
                    tracing::error!(error = %error, "maintenance tick failed");
                }
            }
        }
    }

    tracing::info!("maintenance daemon stopped");
    Ok(())
}
