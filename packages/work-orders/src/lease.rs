//! Lease engine: exclusive TTL leases over items.
//!
//! Every state-changing operation locks the item row inside the caller's
//! transaction, so mutual exclusion holds even with multiple dispatcher
//! processes. `next_available` is only a candidate search; `acquire`
//! re-verifies under the lock because candidates can go stale.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use crate::error::{Result, WorkError};
use crate::kernel::WorkKernel;
use crate::machine::{StateMachine, TransitionOpts};
use crate::metrics::Counter;
use crate::model::states::{Actor, ItemState, OrderState};
use crate::model::{EventKind, WorkEvent, WorkItem, WorkOrder};

/// Error recorded when an item exhausts its attempts through lease expiry.
pub const LEASE_EXPIRED_MAX_ATTEMPTS: &str = "lease_expired_max_attempts";

/// Optional narrowing of the next-available search.
#[derive(Debug, Default, Clone)]
pub struct CheckoutFilters {
    pub order_id: Option<Uuid>,
    pub item_type: Option<String>,
    /// Pass-through marker matched against `meta.tenant_id`; the core does
    /// not enforce tenancy.
    pub tenant_id: Option<String>,
    pub min_priority: Option<i32>,
}

impl CheckoutFilters {
    pub fn for_order(order_id: Uuid) -> Self {
        Self {
            order_id: Some(order_id),
            ..Default::default()
        }
    }
}

/// Outcome of a reclamation sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReclaimOutcome {
    pub requeued: u64,
    pub failed: u64,
}

impl ReclaimOutcome {
    pub fn touched(&self) -> u64 {
        self.requeued + self.failed
    }
}

pub struct LeaseEngine {
    kernel: Arc<WorkKernel>,
    machine: Arc<StateMachine>,
}

impl LeaseEngine {
    pub fn new(kernel: Arc<WorkKernel>, machine: Arc<StateMachine>) -> Self {
        Self { kernel, machine }
    }

    fn ttl(&self) -> chrono::Duration {
        self.kernel.config.lease_ttl()
    }

    /// Find the id of the next eligible item under priority+FIFO.
    ///
    /// Eligible: item queued with no live lease, parent order still open.
    /// Ordering: parent priority DESC, parent created_at ASC, item
    /// created_at ASC.
    pub async fn next_available(
        &self,
        conn: &mut PgConnection,
        filters: &CheckoutFilters,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT i.id
            FROM work_items i
            JOIN work_orders o ON o.id = i.order_id
            WHERE i.state = 'queued'
              AND (i.lease_expires_at IS NULL OR i.lease_expires_at <= $1)
              AND o.state IN ('queued', 'checked_out', 'in_progress')
              AND ($2::UUID IS NULL OR o.id = $2)
              AND ($3::TEXT IS NULL OR i.item_type = $3)
              AND ($4::TEXT IS NULL OR o.meta->>'tenant_id' = $4)
              AND ($5::INTEGER IS NULL OR o.priority >= $5)
            ORDER BY o.priority DESC, o.created_at ASC, i.created_at ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(filters.order_id)
        .bind(&filters.item_type)
        .bind(&filters.tenant_id)
        .bind(filters.min_priority)
        .fetch_optional(conn)
        .await?;

        Ok(id)
    }

    /// Take the lease on a candidate item.
    ///
    /// Re-verifies availability under the row lock; a lost race surfaces as
    /// `LeaseConflict` so the caller can pick another candidate.
    pub async fn acquire(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        agent_id: &str,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkItem> {
        let now = self.kernel.now();
        let mut item = WorkItem::find_for_update(item_id, conn).await?;

        let available = item.state == ItemState::Queued
            && (item.lease_expires_at.is_none() || item.lease_is_expired(now));
        if !available {
            return Err(WorkError::LeaseConflict { item_id });
        }

        item.leased_by_agent_id = Some(agent_id.to_string());
        item.lease_expires_at = Some(now + self.ttl());
        item.last_heartbeat_at = Some(now);
        item.persist_lease(&mut *conn).await?;

        let actor = Actor::agent(agent_id);
        let lease_expires_at = item.lease_expires_at;
        let event = self
            .machine
            .transition_item(
                conn,
                &mut item,
                ItemState::Leased,
                &actor,
                now,
                TransitionOpts::payload(json!({
                    "lease_expires_at": lease_expires_at,
                    "heartbeat_every_seconds": self.kernel.config.heartbeat_every_seconds,
                })),
            )
            .await?;
        events.push(event);

        let mut order = WorkOrder::find_for_update(item.order_id, conn).await?;
        if order.state == OrderState::Queued {
            let event = self
                .machine
                .transition_order(
                    conn,
                    &mut order,
                    OrderState::CheckedOut,
                    &actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
        }

        self.kernel.metrics.increment(Counter::ItemsCheckedOut);

        Ok(item)
    }

    /// Heartbeat: refresh the lease expiry.
    pub async fn extend(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        agent_id: &str,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkItem> {
        let now = self.kernel.now();
        let mut item = WorkItem::find_for_update(item_id, conn).await?;

        if item.leased_by_agent_id.as_deref() != Some(agent_id) {
            return Err(WorkError::LeaseConflict { item_id });
        }
        if item.lease_is_expired(now) {
            return Err(WorkError::LeaseExpired { item_id });
        }

        item.lease_expires_at = Some(now + self.ttl());
        item.last_heartbeat_at = Some(now);
        item.persist_lease(&mut *conn).await?;

        let event = self
            .machine
            .record_event(
                conn,
                item.order_id,
                Some(item.id),
                EventKind::Heartbeat,
                &Actor::agent(agent_id),
                now,
                TransitionOpts::payload(json!({
                    "lease_expires_at": item.lease_expires_at,
                })),
            )
            .await?;
        events.push(event);

        self.kernel.metrics.increment(Counter::Heartbeats);

        Ok(item)
    }

    /// Give the lease back and requeue the item.
    pub async fn release(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        agent_id: &str,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkItem> {
        let now = self.kernel.now();
        let mut item = WorkItem::find_for_update(item_id, conn).await?;

        if item.leased_by_agent_id.as_deref() != Some(agent_id) {
            return Err(WorkError::LeaseConflict { item_id });
        }

        item.clear_lease_fields();
        item.persist_lease(&mut *conn).await?;

        let actor = Actor::agent(agent_id);
        let event = self
            .machine
            .transition_item(
                conn,
                &mut item,
                ItemState::Queued,
                &actor,
                now,
                TransitionOpts::message("lease released"),
            )
            .await?;
        events.push(event);

        // With no other items held or in flight, the order goes back to the
        // pool too.
        let mut order = WorkOrder::find_for_update(item.order_id, conn).await?;
        let active = WorkItem::count_active_for_order(order.id, conn).await?;
        if active == 0
            && matches!(order.state, OrderState::CheckedOut | OrderState::InProgress)
        {
            let event = self
                .machine
                .transition_order(
                    conn,
                    &mut order,
                    OrderState::Queued,
                    &actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
        }

        Ok(item)
    }

    /// Reclaim every expired lease.
    ///
    /// Each item is handled in its own transaction: an item at its attempt
    /// cap fails with `lease_expired_max_attempts`; otherwise the attempt
    /// counter goes up by one and the item requeues. Events publish after
    /// each commit.
    pub async fn reclaim_expired(&self) -> Result<ReclaimOutcome> {
        let now = self.kernel.now();
        let ids = {
            let mut conn = self.kernel.db.acquire().await?;
            WorkItem::find_expired_lease_ids(now, 500, &mut *conn).await?
        };

        let mut outcome = ReclaimOutcome::default();
        for item_id in ids {
            match self.reclaim_one(item_id).await {
                Ok(Some(failed)) => {
                    if failed {
                        outcome.failed += 1;
                    } else {
                        outcome.requeued += 1;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    // Keep sweeping; the next tick retries this item.
                    tracing::warn!(item_id = %item_id, error = %error, "lease reclaim failed");
                }
            }
        }

        self.kernel
            .metrics
            .increment_by(Counter::LeasesReclaimed, outcome.touched());

        Ok(outcome)
    }

    /// Reclaim a single item. Returns `Some(true)` when it failed out,
    /// `Some(false)` when requeued, `None` when the lease turned out live.
    async fn reclaim_one(&self, item_id: Uuid) -> Result<Option<bool>> {
        let now = self.kernel.now();
        let actor = Actor::system("maintainer");

        let mut tx = self.kernel.db.begin().await?;
        let mut item = WorkItem::find_for_update(item_id, &mut *tx).await?;

        // Re-check under the lock; a heartbeat may have raced the sweep.
        let expired = matches!(item.state, ItemState::Leased | ItemState::InProgress)
            && item.lease_is_expired(now);
        if !expired {
            return Ok(None);
        }

        let previous_agent = item.leased_by_agent_id.clone();
        let mut events = Vec::new();

        let failed = if item.attempts >= item.max_attempts {
            item.error = Some(json!({
                "code": LEASE_EXPIRED_MAX_ATTEMPTS,
                "message": format!(
                    "lease expired {} times with max_attempts {}",
                    item.attempts, item.max_attempts
                ),
            }));
            item.persist_results(&mut *tx).await?;

            let event = self
                .machine
                .transition_item(
                    &mut *tx,
                    &mut item,
                    ItemState::Failed,
                    &actor,
                    now,
                    TransitionOpts::payload(json!({"code": LEASE_EXPIRED_MAX_ATTEMPTS})),
                )
                .await?;
            events.push(event);
            true
        } else {
            item.attempts += 1;
            item.clear_lease_fields();
            item.persist_lease(&mut *tx).await?;

            let event = self
                .machine
                .transition_item(
                    &mut *tx,
                    &mut item,
                    ItemState::Queued,
                    &actor,
                    now,
                    TransitionOpts::message("lease expired, requeued"),
                )
                .await?;
            events.push(event);
            false
        };

        let event = self
            .machine
            .record_event(
                &mut *tx,
                item.order_id,
                Some(item.id),
                EventKind::LeaseExpired,
                &actor,
                now,
                TransitionOpts::payload(json!({
                    "agent_id": previous_agent,
                    "attempts": item.attempts,
                })),
            )
            .await?;
        events.push(event);

        tx.commit().await?;
        self.kernel.bus.emit_all(events);

        tracing::info!(
            item_id = %item.id,
            attempts = item.attempts,
            failed,
            "reclaimed expired lease"
        );

        Ok(Some(failed))
    }
}
