//! WorkService: the transport-agnostic callable surface.
//!
//! One externally-initiated operation equals one outer transaction. The
//! service opens it, runs the idempotency guard, delegates to the engines,
//! stores the response snapshot, commits, and only then publishes journal
//! events on the bus. Failure side-paths (stored validation errors, rejected
//! parts, failed applies) run in fresh transactions after rollback.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use crate::allocator::{Allocator, ProposeRequest};
use crate::common::hash::request_fingerprint;
use crate::common::pagination::{Page, PageParams};
use crate::error::{Result, WorkError};
use crate::executor::{Executor, FinalizeMode};
use crate::idempotency::IdempotencyGuard;
use crate::kernel::WorkKernel;
use crate::lease::{CheckoutFilters, LeaseEngine};
use crate::machine::StateMachine;
use crate::maintainer::{MaintenanceFlags, MaintenanceReport, Maintainer};
use crate::model::states::{Actor, OrderState};
use crate::model::{Diff, WorkEvent, WorkItem, WorkItemPart, WorkOrder, WorkProvenance};
use crate::query::{OrderFilter, OrderSort, QuerySurface};
use crate::registry::TypeRegistry;

/// Identity of the caller of a mutating operation, with optional agent
/// metadata for provenance.
#[derive(Debug, Clone)]
pub struct Caller {
    pub actor: Actor,
    pub agent_name: Option<String>,
    pub agent_version: Option<String>,
}

impl Caller {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            agent_name: None,
            agent_version: None,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(Actor::agent(id))
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(Actor::user(id))
    }

    pub fn scheduler() -> Self {
        Self::new(Actor::scheduler())
    }

    pub fn with_agent_info(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.agent_name = Some(name.into());
        self.agent_version = Some(version.into());
        self
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeResponse {
    pub order: WorkOrder,
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order: WorkOrder,
    pub items: Vec<WorkItem>,
    pub recent_events: Vec<WorkEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub item: WorkItem,
    pub heartbeat_every_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub lease_expires_at: chrono::DateTime<chrono::Utc>,
    pub heartbeat_every_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub item: WorkItem,
    pub order_state: OrderState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPartResponse {
    pub part: WorkItemPart,
    pub parts_state: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartsList {
    pub parts: Vec<WorkItemPart>,
    pub parts_state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveResponse {
    pub order: WorkOrder,
    pub diff: Diff,
}

// ============================================================================
// Discovery strategies
// ============================================================================

/// A proposal produced by a discovery strategy.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub request: ProposeRequest,
    pub idempotency_key: String,
}

/// Strategies invoked by `generate` to find new work.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(&self) -> Result<Vec<Discovery>>;
}

// ============================================================================
// Service
// ============================================================================

pub struct WorkService {
    kernel: Arc<WorkKernel>,
    allocator: Allocator,
    executor: Executor,
    lease: Arc<LeaseEngine>,
    maintainer: Maintainer,
    query: QuerySurface,
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
}

/// Bounded retry for the lock-then-verify checkout race.
const CHECKOUT_RETRIES: usize = 3;

impl WorkService {
    pub fn new(kernel: Arc<WorkKernel>, registry: Arc<TypeRegistry>) -> Self {
        let machine = Arc::new(StateMachine::new(
            kernel.config.order_transitions.clone(),
            kernel.config.item_transitions.clone(),
        ));
        let lease = Arc::new(LeaseEngine::new(kernel.clone(), machine.clone()));

        Self {
            allocator: Allocator::new(kernel.clone(), registry.clone(), machine.clone()),
            executor: Executor::new(kernel.clone(), registry.clone(), machine.clone()),
            maintainer: Maintainer::new(kernel.clone(), machine.clone(), lease.clone()),
            query: QuerySurface::new(kernel.clone()),
            lease,
            strategies: Vec::new(),
            kernel,
        }
    }

    pub fn register_strategy(&mut self, strategy: Arc<dyn DiscoveryStrategy>) -> &mut Self {
        self.strategies.push(strategy);
        self
    }

    pub fn kernel(&self) -> &Arc<WorkKernel> {
        &self.kernel
    }

    // ========================================================================
    // Propose
    // ========================================================================

    /// Validate, persist, and plan a new order.
    pub async fn propose(
        &self,
        request: ProposeRequest,
        caller: &Caller,
        idempotency_key: Option<&str>,
    ) -> Result<ProposeResponse> {
        let scope = IdempotencyGuard::scope("propose", &request.order_type);
        let key_hash = self.resolve_key("propose", idempotency_key)?;
        let fingerprint = request_fingerprint(
            "propose",
            &json!({
                "order_type": request.order_type,
                "payload": request.payload,
                "meta": request.meta,
                "priority": request.priority,
            }),
        );

        let mut tx = self.kernel.db.begin().await?;
        if let Some(hash) = &key_hash {
            if let Some(cached) =
                IdempotencyGuard::check(&mut *tx, &scope, hash, self.kernel.now()).await?
            {
                return Ok(serde_json::from_value(cached)?);
            }
        }

        let mut events = Vec::new();
        let order = self
            .allocator
            .propose(&mut *tx, &request, &caller.actor, &mut events)
            .await?;
        let items = self
            .allocator
            .plan(&mut *tx, &order, &caller.actor, &mut events)
            .await?;

        self.record_provenance(
            &mut *tx,
            Some(order.id),
            None,
            caller,
            &fingerprint,
            key_hash.as_deref(),
        )
        .await?;

        let response = ProposeResponse { order, items };
        if let Some(hash) = &key_hash {
            let snapshot = serde_json::to_value(&response)?;
            IdempotencyGuard::store(&mut *tx, &scope, hash, &snapshot).await?;
        }
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(response)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn list(
        &self,
        filter: &OrderFilter,
        sort: Option<OrderSort>,
        page: Option<PageParams>,
    ) -> Result<Page<WorkOrder>> {
        let mut conn = self.kernel.db.acquire().await?;
        self.query.list_orders(&mut *conn, filter, sort, page).await
    }

    pub async fn get(&self, order_id: Uuid) -> Result<OrderDetail> {
        let mut conn = self.kernel.db.acquire().await?;
        let order = WorkOrder::find_by_id(order_id, &mut *conn).await?;
        let items = WorkItem::find_for_order(order_id, &mut *conn).await?;
        let recent_events = self.query.order_events(&mut *conn, order_id, None).await?;

        Ok(OrderDetail {
            order,
            items,
            recent_events,
        })
    }

    /// Events for an order or an item.
    pub async fn logs(
        &self,
        order_id: Option<Uuid>,
        item_id: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<Vec<WorkEvent>> {
        let mut conn = self.kernel.db.acquire().await?;
        match (order_id, item_id) {
            (_, Some(item_id)) => self.query.item_events(&mut *conn, item_id, limit).await,
            (Some(order_id), None) => self.query.order_events(&mut *conn, order_id, limit).await,
            (None, None) => Ok(Vec::new()),
        }
    }

    // ========================================================================
    // Checkout / lease
    // ========================================================================

    /// Check out the next eligible item matching the filters.
    ///
    /// Candidates can go stale between selection and the row lock, so a lost
    /// race retries a bounded number of times before surfacing.
    pub async fn checkout(
        &self,
        filters: &CheckoutFilters,
        caller: &Caller,
    ) -> Result<CheckoutResponse> {
        let agent_id = caller.actor.id.clone();

        for attempt in 0..CHECKOUT_RETRIES {
            let mut tx = self.kernel.db.begin().await?;
            let candidate = self
                .lease
                .next_available(&mut *tx, filters, self.kernel.now())
                .await?;
            let Some(item_id) = candidate else {
                return Err(WorkError::NoItemsAvailable);
            };

            let mut events = Vec::new();
            match self
                .lease
                .acquire(&mut *tx, item_id, &agent_id, &mut events)
                .await
            {
                Ok(item) => {
                    let fingerprint = request_fingerprint(
                        "checkout",
                        &json!({"item_id": item.id, "agent_id": agent_id}),
                    );
                    self.record_provenance(
                        &mut *tx,
                        Some(item.order_id),
                        Some(item.id),
                        caller,
                        &fingerprint,
                        None,
                    )
                    .await?;

                    tx.commit().await?;
                    self.kernel.bus.emit_all(events);

                    return Ok(CheckoutResponse {
                        item,
                        heartbeat_every_seconds: self.kernel.config.heartbeat_every_seconds,
                    });
                }
                Err(WorkError::LeaseConflict { .. }) if attempt + 1 < CHECKOUT_RETRIES => {
                    tracing::debug!(item_id = %item_id, attempt, "checkout race lost, retrying");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }

        Err(WorkError::NoItemsAvailable)
    }

    /// Check out the next eligible item of one order.
    pub async fn checkout_order(
        &self,
        order_id: Uuid,
        caller: &Caller,
    ) -> Result<CheckoutResponse> {
        self.checkout(&CheckoutFilters::for_order(order_id), caller).await
    }

    /// Refresh the caller's lease.
    pub async fn heartbeat(&self, item_id: Uuid, caller: &Caller) -> Result<HeartbeatResponse> {
        let mut tx = self.kernel.db.begin().await?;
        let mut events = Vec::new();
        let item = self
            .lease
            .extend(&mut *tx, item_id, &caller.actor.id, &mut events)
            .await?;
        let lease_expires_at = item
            .lease_expires_at
            .ok_or(WorkError::LeaseExpired { item_id })?;
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(HeartbeatResponse {
            lease_expires_at,
            heartbeat_every_seconds: self.kernel.config.heartbeat_every_seconds,
        })
    }

    /// Give an item back to the pool.
    pub async fn release(&self, item_id: Uuid, caller: &Caller) -> Result<WorkItem> {
        let mut tx = self.kernel.db.begin().await?;
        let mut events = Vec::new();
        let item = self
            .lease
            .release(&mut *tx, item_id, &caller.actor.id, &mut events)
            .await?;
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(item)
    }

    // ========================================================================
    // Submit / finalize
    // ========================================================================

    /// Submit a result for a leased item.
    pub async fn submit(
        &self,
        item_id: Uuid,
        result: Value,
        evidence: Option<Value>,
        notes: Option<String>,
        caller: &Caller,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitResponse> {
        let scope = IdempotencyGuard::item_scope("submit", item_id);
        let key_hash = self.resolve_key("submit", idempotency_key)?;
        let agent_id = caller.actor.id.clone();
        let fingerprint = request_fingerprint(
            "submit",
            &json!({"item_id": item_id, "result": result, "agent_id": agent_id}),
        );

        let mut tx = self.kernel.db.begin().await?;
        if let Some(hash) = &key_hash {
            if let Some(cached) =
                IdempotencyGuard::check(&mut *tx, &scope, hash, self.kernel.now()).await?
            {
                return Ok(serde_json::from_value(cached)?);
            }
        }

        let mut events = Vec::new();
        let outcome = self
            .executor
            .submit(
                &mut *tx,
                item_id,
                &agent_id,
                result,
                evidence,
                notes,
                &mut events,
            )
            .await;

        let item = match outcome {
            Ok(item) => item,
            Err(WorkError::ValidationFailed { errors }) => {
                drop(tx);
                self.executor
                    .record_submission_failure(item_id, &errors)
                    .await?;
                return Err(WorkError::ValidationFailed { errors });
            }
            Err(error) => return self.fail_apply_if_needed(tx, error).await,
        };

        let order = WorkOrder::find_by_id(item.order_id, &mut *tx).await?;
        self.record_provenance(
            &mut *tx,
            Some(item.order_id),
            Some(item.id),
            caller,
            &fingerprint,
            key_hash.as_deref(),
        )
        .await?;

        let response = SubmitResponse {
            item,
            order_state: order.state,
        };
        if let Some(hash) = &key_hash {
            let snapshot = serde_json::to_value(&response)?;
            IdempotencyGuard::store(&mut *tx, &scope, hash, &snapshot).await?;
        }
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(response)
    }

    /// Submit one part of an item's result.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_part(
        &self,
        item_id: Uuid,
        part_key: &str,
        seq: Option<i32>,
        payload: Value,
        evidence: Option<Value>,
        notes: Option<String>,
        caller: &Caller,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitPartResponse> {
        let scope = IdempotencyGuard::item_scope("submit-part", item_id);
        let key_hash = self.resolve_key("submit-part", idempotency_key)?;
        let agent_id = caller.actor.id.clone();
        let fingerprint = request_fingerprint(
            "submit-part",
            &json!({
                "item_id": item_id,
                "part_key": part_key,
                "seq": seq,
                "payload": payload,
            }),
        );

        let mut tx = self.kernel.db.begin().await?;
        if let Some(hash) = &key_hash {
            if let Some(cached) =
                IdempotencyGuard::check(&mut *tx, &scope, hash, self.kernel.now()).await?
            {
                return Ok(serde_json::from_value(cached)?);
            }
        }

        let mut events = Vec::new();
        let outcome = self
            .executor
            .submit_part(
                &mut *tx,
                item_id,
                &agent_id,
                part_key,
                seq,
                payload.clone(),
                evidence,
                notes,
                &mut events,
            )
            .await;

        let (part, parts_state) = match outcome {
            Ok(result) => result,
            Err(WorkError::ValidationFailed { errors }) => {
                drop(tx);
                self.executor
                    .record_part_rejection(item_id, &agent_id, part_key, seq, payload, &errors)
                    .await?;
                return Err(WorkError::ValidationFailed { errors });
            }
            Err(error) => return Err(error),
        };

        self.record_provenance(
            &mut *tx,
            None,
            Some(item_id),
            caller,
            &fingerprint,
            key_hash.as_deref(),
        )
        .await?;

        let response = SubmitPartResponse { part, parts_state };
        if let Some(hash) = &key_hash {
            let snapshot = serde_json::to_value(&response)?;
            IdempotencyGuard::store(&mut *tx, &scope, hash, &snapshot).await?;
        }
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(response)
    }

    /// List stored parts of an item.
    pub async fn list_parts(
        &self,
        item_id: Uuid,
        part_key: Option<&str>,
        status: Option<crate::model::PartStatus>,
    ) -> Result<PartsList> {
        let mut conn = self.kernel.db.acquire().await?;
        let item = WorkItem::find_by_id(item_id, &mut *conn).await?;
        let parts = WorkItemPart::find_for_item(item_id, part_key, status, &mut *conn).await?;

        Ok(PartsList {
            parts,
            parts_state: item.parts_state,
        })
    }

    /// Assemble the latest validated parts into the item result.
    pub async fn finalize(
        &self,
        item_id: Uuid,
        mode: FinalizeMode,
        caller: &Caller,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitResponse> {
        let scope = IdempotencyGuard::item_scope("finalize", item_id);
        let key_hash = self.resolve_key("finalize", idempotency_key)?;
        let fingerprint =
            request_fingerprint("finalize", &json!({"item_id": item_id, "mode": format!("{mode:?}")}));

        let mut tx = self.kernel.db.begin().await?;
        if let Some(hash) = &key_hash {
            if let Some(cached) =
                IdempotencyGuard::check(&mut *tx, &scope, hash, self.kernel.now()).await?
            {
                return Ok(serde_json::from_value(cached)?);
            }
        }

        let mut events = Vec::new();
        let item = match self
            .executor
            .finalize(&mut *tx, item_id, mode, &caller.actor, &mut events)
            .await
        {
            Ok(item) => item,
            Err(error) => return self.fail_apply_if_needed(tx, error).await,
        };

        let order = WorkOrder::find_by_id(item.order_id, &mut *tx).await?;
        self.record_provenance(
            &mut *tx,
            Some(item.order_id),
            Some(item.id),
            caller,
            &fingerprint,
            key_hash.as_deref(),
        )
        .await?;

        let response = SubmitResponse {
            item,
            order_state: order.state,
        };
        if let Some(hash) = &key_hash {
            let snapshot = serde_json::to_value(&response)?;
            IdempotencyGuard::store(&mut *tx, &scope, hash, &snapshot).await?;
        }
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(response)
    }

    // ========================================================================
    // Review
    // ========================================================================

    /// Approve a submitted order and apply it.
    pub async fn approve(
        &self,
        order_id: Uuid,
        caller: &Caller,
        idempotency_key: Option<&str>,
    ) -> Result<ApproveResponse> {
        let scope = IdempotencyGuard::order_scope("approve", order_id);
        let key_hash = self.resolve_key("approve", idempotency_key)?;
        let fingerprint = request_fingerprint(
            "approve",
            &json!({"order_id": order_id, "actor": caller.actor.id}),
        );

        let mut tx = self.kernel.db.begin().await?;
        if let Some(hash) = &key_hash {
            if let Some(cached) =
                IdempotencyGuard::check(&mut *tx, &scope, hash, self.kernel.now()).await?
            {
                return Ok(serde_json::from_value(cached)?);
            }
        }

        let mut events = Vec::new();
        let (order, diff) = match self
            .executor
            .approve(&mut *tx, order_id, &caller.actor, &mut events)
            .await
        {
            Ok(result) => result,
            Err(error) => return self.fail_apply_if_needed(tx, error).await,
        };

        self.record_provenance(
            &mut *tx,
            Some(order_id),
            None,
            caller,
            &fingerprint,
            key_hash.as_deref(),
        )
        .await?;

        let response = ApproveResponse { order, diff };
        if let Some(hash) = &key_hash {
            let snapshot = serde_json::to_value(&response)?;
            IdempotencyGuard::store(&mut *tx, &scope, hash, &snapshot).await?;
        }
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(response)
    }

    /// Reject a submitted order, optionally sending it back for rework.
    pub async fn reject(
        &self,
        order_id: Uuid,
        errors: Value,
        allow_rework: bool,
        caller: &Caller,
        idempotency_key: Option<&str>,
    ) -> Result<WorkOrder> {
        let scope = IdempotencyGuard::order_scope("reject", order_id);
        let key_hash = self.resolve_key("reject", idempotency_key)?;
        let fingerprint = request_fingerprint(
            "reject",
            &json!({"order_id": order_id, "errors": errors, "allow_rework": allow_rework}),
        );

        let mut tx = self.kernel.db.begin().await?;
        if let Some(hash) = &key_hash {
            if let Some(cached) =
                IdempotencyGuard::check(&mut *tx, &scope, hash, self.kernel.now()).await?
            {
                return Ok(serde_json::from_value(cached)?);
            }
        }

        let mut events = Vec::new();
        let order = self
            .executor
            .reject(
                &mut *tx,
                order_id,
                errors,
                &caller.actor,
                allow_rework,
                &mut events,
            )
            .await?;

        self.record_provenance(
            &mut *tx,
            Some(order_id),
            None,
            caller,
            &fingerprint,
            key_hash.as_deref(),
        )
        .await?;

        if let Some(hash) = &key_hash {
            let snapshot = serde_json::to_value(&order)?;
            IdempotencyGuard::store(&mut *tx, &scope, hash, &snapshot).await?;
        }
        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        Ok(order)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run a maintenance tick.
    pub async fn maintain(&self, flags: MaintenanceFlags) -> Result<MaintenanceReport> {
        self.maintainer.run(flags).await
    }

    /// Invoke every registered discovery strategy and propose what it finds
    /// as `system:scheduler`.
    pub async fn generate(&self) -> Result<Vec<WorkOrder>> {
        let caller = Caller::scheduler();
        let mut orders = Vec::new();

        for strategy in &self.strategies {
            let discoveries = match strategy.discover().await {
                Ok(discoveries) => discoveries,
                Err(error) => {
                    tracing::warn!(strategy = strategy.name(), error = %error, "discovery failed");
                    continue;
                }
            };

            for discovery in discoveries {
                match self
                    .propose(
                        discovery.request,
                        &caller,
                        Some(discovery.idempotency_key.as_str()),
                    )
                    .await
                {
                    Ok(response) => orders.push(response.order),
                    Err(error) => {
                        tracing::warn!(
                            strategy = strategy.name(),
                            error = %error,
                            "discovered proposal rejected"
                        );
                    }
                }
            }
        }

        Ok(orders)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn resolve_key(&self, operation: &str, key: Option<&str>) -> Result<Option<String>> {
        if self.kernel.config.requires_idempotency_key(operation) {
            IdempotencyGuard::require_key(operation, key).map(Some)
        } else {
            Ok(key
                .filter(|k| !k.is_empty())
                .map(crate::common::hash::hash_idempotency_key))
        }
    }

    async fn record_provenance(
        &self,
        conn: &mut PgConnection,
        order_id: Option<Uuid>,
        item_id: Option<Uuid>,
        caller: &Caller,
        fingerprint: &str,
        key_hash: Option<&str>,
    ) -> Result<()> {
        let provenance = WorkProvenance {
            id: crate::common::id::db_id(),
            order_id,
            item_id,
            agent_id: caller.actor.id.clone(),
            agent_name: caller.agent_name.clone(),
            agent_version: caller.agent_version.clone(),
            request_fingerprint: fingerprint.to_string(),
            idempotency_key_hash: key_hash.map(str::to_string),
            extra: None,
            created_at: self.kernel.now(),
        };
        provenance.insert(conn).await?;

        Ok(())
    }

    /// Roll back and record an apply failure; other errors pass through.
    async fn fail_apply_if_needed<T>(
        &self,
        tx: sqlx::Transaction<'static, sqlx::Postgres>,
        error: WorkError,
    ) -> Result<T> {
        if let WorkError::ApplyFailed { order_id, .. } = &error {
            let order_id = *order_id;
            drop(tx);
            if let Err(record_error) = self.executor.record_apply_failure(order_id, &error).await {
                tracing::error!(
                    order_id = %order_id,
                    error = %record_error,
                    "failed to record apply failure"
                );
            }
        }
        Err(error)
    }
}
