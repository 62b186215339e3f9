//! Test harness with testcontainers for integration testing.
//!
//! A single Postgres container is shared across every test; each harness
//! creates its own database inside it and runs migrations there, so tests
//! never observe each other's rows.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres as PostgresImage;
use tokio::sync::OnceCell;
use uuid::Uuid;

use work_orders_core::allocator::ProposeRequest;
use work_orders_core::model::{Diff, WorkItem, WorkOrder};
use work_orders_core::order_type::{
    AcceptancePolicy, ApplyContext, ItemSpec, OrderType, RulePolicy,
};
use work_orders_core::service::ProposeResponse;
use work_orders_core::{
    Caller, Config, EchoOrderType, FieldError, ManualClock, TypeRegistry, WorkKernel, WorkService,
};

// =============================================================================
// Shared container
// =============================================================================

struct SharedPostgres {
    host: String,
    port: u16,
    _container: ContainerAsync<PostgresImage>,
}

static SHARED_POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

impl SharedPostgres {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = PostgresImage::default()
            .start()
            .await
            .context("failed to start Postgres container")?;
        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;

        Ok(Self {
            host,
            port,
            _container: container,
        })
    }

    async fn get() -> &'static Self {
        SHARED_POSTGRES
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("failed to initialize shared Postgres container")
            })
            .await
    }

    fn url(&self, database: &str) -> String {
        format!(
            "postgresql://postgres:postgres@{}:{}/{}",
            self.host, self.port, database
        )
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Per-test infrastructure: an isolated database, a manual clock, and a
/// fully wired service.
pub struct TestHarness {
    pub db_pool: PgPool,
    pub clock: Arc<ManualClock>,
    pub kernel: Arc<WorkKernel>,
    pub service: WorkService,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Result<Self> {
        Self::with_setup(config, |_| {}).await
    }

    /// Build a harness with extra order types registered.
    pub async fn with_setup(
        config: Config,
        register: impl FnOnce(&mut TypeRegistry),
    ) -> Result<Self> {
        let shared = SharedPostgres::get().await;

        let database = format!("work_test_{}", Uuid::new_v4().simple());
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&shared.url("postgres"))
            .await
            .context("failed to connect to admin database")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{database}""#))
            .execute(&admin_pool)
            .await
            .context("failed to create test database")?;
        admin_pool.close().await;

        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&shared.url(&database))
            .await
            .context("failed to connect to test database")?;
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("failed to run migrations")?;

        let clock = Arc::new(ManualClock::starting_now());
        let kernel = Arc::new(WorkKernel::with_clock(
            db_pool.clone(),
            config,
            clock.clone(),
        ));

        let mut registry = TypeRegistry::new();
        registry.register(Arc::new(EchoOrderType::new()));
        registry.register(Arc::new(ReportOrderType));
        register(&mut registry);

        let service = WorkService::new(kernel.clone(), Arc::new(registry));

        Ok(Self {
            db_pool,
            clock,
            kernel,
            service,
        })
    }

    /// Propose an echo order and return it with its planned items.
    pub async fn propose_echo(
        &self,
        message: &str,
        priority: i32,
        caller: &Caller,
    ) -> Result<ProposeResponse> {
        let request = ProposeRequest::new("echo", json!({"message": message}))
            .with_priority(priority);
        let response = self
            .service
            .propose(request, caller, Some(&unique_key()))
            .await?;
        Ok(response)
    }

    /// Propose a report order (two required parts) and return it.
    pub async fn propose_report(&self, caller: &Caller) -> Result<ProposeResponse> {
        let request = ProposeRequest::new("report", json!({"topic": "quarterly"}));
        let response = self
            .service
            .propose(request, caller, Some(&unique_key()))
            .await?;
        Ok(response)
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

/// A fresh idempotency key.
pub fn unique_key() -> String {
    Uuid::new_v4().to_string()
}

/// A result document the echo acceptance policy accepts.
pub fn echo_result(message: &str) -> Value {
    json!({"ok": true, "verified": true, "echoed_message": message})
}

// =============================================================================
// Report order type (partial submissions)
// =============================================================================

/// Test order type exercising partial submissions: one item requiring the
/// `research` and `analysis` parts, each of which must carry `content`.
pub struct ReportOrderType;

#[async_trait]
impl OrderType for ReportOrderType {
    fn type_id(&self) -> &'static str {
        "report"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["topic"],
            "properties": {
                "topic": {"type": "string", "minLength": 1}
            }
        })
    }

    async fn plan(&self, order: &WorkOrder) -> work_orders_core::error::Result<Vec<ItemSpec>> {
        let spec = ItemSpec::new("report", json!({"topic": order.payload["topic"]}))
            .with_parts_required(vec!["research".to_string(), "analysis".to_string()]);
        Ok(vec![spec])
    }

    fn acceptance_policy(&self) -> Arc<dyn AcceptancePolicy> {
        Arc::new(RulePolicy::permissive())
    }

    async fn apply(&self, ctx: ApplyContext<'_>) -> work_orders_core::error::Result<Diff> {
        let mut after = serde_json::Map::new();
        for item in ctx.items {
            if let Some(result) = &item.result {
                after.insert(item.id.to_string(), result.clone());
            }
        }
        Ok(Diff::between(serde_json::Map::new(), after)
            .with_summary(format!("Applied report order with {} items", ctx.items.len())))
    }

    fn partial_rules(
        &self,
        _item: &WorkItem,
        part_key: &str,
        _seq: Option<i32>,
        payload: &Value,
    ) -> work_orders_core::error::Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        if !matches!(part_key, "research" | "analysis") {
            errors.push(FieldError::new(
                part_key,
                "unknown_part",
                "part key is not recognized",
            ));
        }
        if payload.get("content").map(Value::is_null).unwrap_or(true) {
            errors.push(FieldError::new("content", "required", "part needs content"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
