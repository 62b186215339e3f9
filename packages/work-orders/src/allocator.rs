//! Allocator: turns proposals into persisted orders and plans them into
//! items.

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::postgres::PgConnection;

use crate::error::{Result, WorkError};
use crate::kernel::WorkKernel;
use crate::machine::{StateMachine, TransitionOpts};
use crate::metrics::Counter;
use crate::model::states::Actor;
use crate::model::{EventKind, WorkEvent, WorkItem, WorkOrder};
use crate::registry::TypeRegistry;
use crate::schema;

/// A proposal for a new order.
#[derive(Debug, Clone)]
pub struct ProposeRequest {
    pub order_type: String,
    pub payload: Value,
    pub meta: Option<Value>,
    pub priority: Option<i32>,
}

impl ProposeRequest {
    pub fn new(order_type: impl Into<String>, payload: Value) -> Self {
        Self {
            order_type: order_type.into(),
            payload,
            meta: None,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

pub struct Allocator {
    kernel: Arc<WorkKernel>,
    registry: Arc<TypeRegistry>,
    machine: Arc<StateMachine>,
}

impl Allocator {
    pub fn new(
        kernel: Arc<WorkKernel>,
        registry: Arc<TypeRegistry>,
        machine: Arc<StateMachine>,
    ) -> Self {
        Self {
            kernel,
            registry,
            machine,
        }
    }

    /// Validate and persist a proposal as a queued order.
    pub async fn propose(
        &self,
        conn: &mut PgConnection,
        request: &ProposeRequest,
        actor: &Actor,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkOrder> {
        let order_type = self.registry.get(&request.order_type)?;
        schema::check(&order_type.schema(), &request.payload)
            .map_err(|errors| WorkError::ValidationFailed { errors })?;

        let now = self.kernel.now();
        let order = WorkOrder::builder()
            .order_type(request.order_type.clone())
            .priority(request.priority.unwrap_or(0))
            .payload(request.payload.clone())
            .requested_by_kind(actor.kind)
            .requested_by_id(actor.id.clone())
            .created_at(now)
            .last_transitioned_at(now)
            .build();
        let order = WorkOrder {
            meta: request.meta.clone(),
            ..order
        };
        let order = order.insert(&mut *conn).await?;

        let event = self
            .machine
            .record_event(
                conn,
                order.id,
                None,
                EventKind::Proposed,
                actor,
                now,
                TransitionOpts::payload(json!({
                    "order_type": order.order_type,
                    "priority": order.priority,
                })),
            )
            .await?;
        events.push(event);

        self.kernel.metrics.increment(Counter::OrdersProposed);
        tracing::info!(
            order_id = %order.id,
            order_type = %order.order_type,
            priority = order.priority,
            "order proposed"
        );

        Ok(order)
    }

    /// Plan an order into queued items.
    ///
    /// Re-planning an already-planned order inserts nothing and returns the
    /// existing items.
    pub async fn plan(
        &self,
        conn: &mut PgConnection,
        order: &WorkOrder,
        actor: &Actor,
        events: &mut Vec<WorkEvent>,
    ) -> Result<Vec<WorkItem>> {
        let existing = WorkItem::count_for_order(order.id, &mut *conn).await?;
        if existing > 0 {
            return WorkItem::find_for_order(order.id, conn).await;
        }

        let order_type = self.registry.get(&order.order_type)?;
        let specs = order_type.plan(order).await?;
        let now = self.kernel.now();

        let mut items = Vec::with_capacity(specs.len());
        for spec in specs {
            let item = WorkItem::builder()
                .order_id(order.id)
                .item_type(spec.item_type)
                .max_attempts(
                    spec.max_attempts
                        .unwrap_or(self.kernel.config.default_max_attempts),
                )
                .input(spec.input)
                .created_at(now)
                .build();
            let item = WorkItem {
                parts_required: spec.parts_required,
                ..item
            };
            items.push(item.insert(&mut *conn).await?);
        }

        let event = self
            .machine
            .record_event(
                conn,
                order.id,
                None,
                EventKind::Planned,
                actor,
                now,
                TransitionOpts::payload(json!({"count": items.len()})),
            )
            .await?;
        events.push(event);

        self.kernel
            .metrics
            .increment_by(Counter::ItemsPlanned, items.len() as u64);
        tracing::info!(order_id = %order.id, count = items.len(), "order planned");

        Ok(items)
    }
}
