//! Executor: submission, review, apply, and partial-result assembly.
//!
//! Every public method runs inside the caller's transaction and appends the
//! journal events it wrote to `events` for post-commit publication. The
//! failure side-paths (`record_submission_failure`,
//! `record_part_rejection`, `record_apply_failure`) open their own
//! transactions because they persist evidence of a failure whose main
//! transaction rolled back.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use crate::common::hash::payload_checksum;
use crate::error::{FieldError, Result, WorkError};
use crate::kernel::WorkKernel;
use crate::machine::{StateMachine, TransitionOpts};
use crate::metrics::Counter;
use crate::model::states::{Actor, ItemState, OrderState, PartStatus};
use crate::model::{Diff, EventKind, WorkEvent, WorkItem, WorkItemPart, WorkOrder};
use crate::order_type::ApplyContext;
use crate::registry::TypeRegistry;

/// How finalize treats missing required parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeMode {
    /// Validated latest parts must cover exactly the required keys.
    Strict,
    /// Assemble whatever validated parts exist.
    BestEffort,
}

pub struct Executor {
    kernel: Arc<WorkKernel>,
    registry: Arc<TypeRegistry>,
    machine: Arc<StateMachine>,
}

impl Executor {
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

    // ========================================================================
    // Submission
    // ========================================================================

    /// Accept a result for a leased item.
    pub async fn submit(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        agent_id: &str,
        result: Value,
        evidence: Option<Value>,
        notes: Option<String>,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkItem> {
        let now = self.kernel.now();
        let mut item = WorkItem::find_for_update(item_id, conn).await?;
        self.verify_active_lease(&item, agent_id)?;

        let order = WorkOrder::find_for_update(item.order_id, conn).await?;
        let order_type = self.registry.get(&order.order_type)?;
        order_type
            .acceptance_policy()
            .validate_submission(&item, &result)
            .map_err(|errors| WorkError::ValidationFailed { errors })?;

        item.result = Some(result.clone());
        item.error = None;
        item.persist_results(&mut *conn).await?;

        let actor = Actor::agent(agent_id);
        let event = self
            .machine
            .transition_item(
                conn,
                &mut item,
                ItemState::Submitted,
                &actor,
                now,
                TransitionOpts::payload(json!({
                    "result": result,
                    "evidence": evidence,
                    "notes": notes,
                })),
            )
            .await?;
        events.push(event);

        self.kernel.metrics.increment(Counter::ItemsSubmitted);

        self.settle_order_after_submission(conn, order, &actor, events)
            .await?;

        Ok(item)
    }

    /// Persist the validation error of a rejected submission.
    ///
    /// Runs in its own transaction: the submit transaction rolled back, but
    /// the stored error is part of the item's record.
    pub async fn record_submission_failure(
        &self,
        item_id: Uuid,
        errors: &[FieldError],
    ) -> Result<()> {
        let mut tx = self.kernel.db.begin().await?;
        let mut item = WorkItem::find_for_update(item_id, &mut *tx).await?;
        item.error = Some(json!({
            "code": "validation_failed",
            "errors": errors,
        }));
        item.persist_results(&mut *tx).await?;
        tx.commit().await?;

        Ok(())
    }

    // ========================================================================
    // Review
    // ========================================================================

    /// Approve a submitted order and apply it in the same transaction.
    pub async fn approve(
        &self,
        conn: &mut PgConnection,
        order_id: Uuid,
        actor: &Actor,
        events: &mut Vec<WorkEvent>,
    ) -> Result<(WorkOrder, Diff)> {
        let now = self.kernel.now();
        let mut order = WorkOrder::find_for_update(order_id, conn).await?;
        let items = WorkItem::find_for_order(order_id, &mut *conn).await?;

        let order_type = self.registry.get(&order.order_type)?;
        if !order_type.acceptance_policy().ready_for_approval(&order, &items) {
            return Err(WorkError::NotReadyForApproval { order_id });
        }

        let event = self
            .machine
            .transition_order(
                conn,
                &mut order,
                OrderState::Approved,
                actor,
                now,
                TransitionOpts::default(),
            )
            .await?;
        events.push(event);
        self.kernel.metrics.increment(Counter::OrdersApproved);

        let diff = self.apply(conn, &mut order, events).await?;

        Ok((order, diff))
    }

    /// Run the order type's apply step and settle the order.
    ///
    /// Shares the caller's transaction; any failure bubbles as `ApplyFailed`
    /// and the caller rolls everything back.
    pub async fn apply(
        &self,
        conn: &mut PgConnection,
        order: &mut WorkOrder,
        events: &mut Vec<WorkEvent>,
    ) -> Result<Diff> {
        let now = self.kernel.now();
        let order_type = self.registry.get(&order.order_type)?;
        let actor = Actor::system("executor");

        order_type
            .before_apply(order)
            .await
            .map_err(|error| apply_failed(order.id, error))?;

        let items = WorkItem::find_for_order(order.id, &mut *conn).await?;
        let diff = order_type
            .apply(ApplyContext {
                conn: &mut *conn,
                order,
                items: &items,
            })
            .await
            .map_err(|error| apply_failed(order.id, error))?;

        let diff_value = serde_json::to_value(&diff)?;
        let event = self
            .machine
            .transition_order(
                conn,
                order,
                OrderState::Applied,
                &actor,
                now,
                TransitionOpts {
                    diff: Some(diff_value),
                    message: diff.summary.clone(),
                    payload: None,
                },
            )
            .await?;
        events.push(event);
        self.kernel.metrics.increment(Counter::OrdersApplied);

        let accepted = WorkItem::accept_submitted_for_order(order.id, now, &mut *conn).await?;
        for item_id in &accepted {
            let event = self
                .machine
                .record_event(
                    conn,
                    order.id,
                    Some(*item_id),
                    EventKind::Accepted,
                    &actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
        }

        order_type
            .after_apply(order, &diff)
            .await
            .map_err(|error| apply_failed(order.id, error))?;

        let completed = WorkItem::complete_accepted_for_order(order.id, &mut *conn).await?;
        for item_id in &completed {
            let event = self
                .machine
                .record_event(
                    conn,
                    order.id,
                    Some(*item_id),
                    EventKind::Completed,
                    &actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
        }

        let remaining = WorkItem::count_not_completed_for_order(order.id, &mut *conn).await?;
        if remaining == 0 {
            let event = self
                .machine
                .transition_order(
                    conn,
                    order,
                    OrderState::Completed,
                    &actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
            self.kernel.metrics.increment(Counter::OrdersCompleted);
        }

        Ok(diff)
    }

    /// Mark an order failed after its apply transaction rolled back.
    pub async fn record_apply_failure(&self, order_id: Uuid, error: &WorkError) -> Result<()> {
        let now = self.kernel.now();
        let actor = Actor::system("executor");

        let mut tx = self.kernel.db.begin().await?;
        let mut order = WorkOrder::find_for_update(order_id, &mut *tx).await?;
        let event = self
            .machine
            .transition_order(
                &mut *tx,
                &mut order,
                OrderState::Failed,
                &actor,
                now,
                TransitionOpts::payload(json!({
                    "code": error.code(),
                    "message": error.to_string(),
                })),
            )
            .await?;
        tx.commit().await?;
        self.kernel.bus.emit(event);
        self.kernel.metrics.increment(Counter::OrdersFailed);

        tracing::error!(order_id = %order_id, error = %error, "apply failed; order marked failed");

        Ok(())
    }

    /// Reject a submitted order, optionally requeueing it for rework.
    pub async fn reject(
        &self,
        conn: &mut PgConnection,
        order_id: Uuid,
        errors: Value,
        actor: &Actor,
        allow_rework: bool,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkOrder> {
        let now = self.kernel.now();
        let mut order = WorkOrder::find_for_update(order_id, conn).await?;

        let event = self
            .machine
            .transition_order(
                conn,
                &mut order,
                OrderState::Rejected,
                actor,
                now,
                TransitionOpts::payload(json!({"errors": errors})),
            )
            .await?;
        events.push(event);
        self.kernel.metrics.increment(Counter::OrdersRejected);

        if allow_rework {
            // Two legal steps: rejected -> queued, and each reviewed item
            // goes back through rejected to the pool.
            let event = self
                .machine
                .transition_order(
                    conn,
                    &mut order,
                    OrderState::Queued,
                    actor,
                    now,
                    TransitionOpts::message("rework requested"),
                )
                .await?;
            events.push(event);

            let items = WorkItem::find_for_order(order_id, &mut *conn).await?;
            for mut item in items {
                if item.state != ItemState::Submitted {
                    continue;
                }
                let event = self
                    .machine
                    .transition_item(
                        conn,
                        &mut item,
                        ItemState::Rejected,
                        actor,
                        now,
                        TransitionOpts::default(),
                    )
                    .await?;
                events.push(event);
                let event = self
                    .machine
                    .transition_item(
                        conn,
                        &mut item,
                        ItemState::Queued,
                        actor,
                        now,
                        TransitionOpts::message("rework requested"),
                    )
                    .await?;
                events.push(event);
            }
        }

        Ok(order)
    }

    /// Record an item-level failure.
    pub async fn fail(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        error: Value,
        actor: &Actor,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkItem> {
        let now = self.kernel.now();
        let mut item = WorkItem::find_for_update(item_id, conn).await?;

        item.error = Some(error.clone());
        item.persist_results(&mut *conn).await?;

        let event = self
            .machine
            .transition_item(
                conn,
                &mut item,
                ItemState::Failed,
                actor,
                now,
                TransitionOpts::payload(error),
            )
            .await?;
        events.push(event);

        Ok(item)
    }

    // ========================================================================
    // Partial submissions
    // ========================================================================

    /// Store one validated part of an item's result.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_part(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        agent_id: &str,
        part_key: &str,
        seq: Option<i32>,
        payload: Value,
        evidence: Option<Value>,
        notes: Option<String>,
        events: &mut Vec<WorkEvent>,
    ) -> Result<(WorkItemPart, Value)> {
        let now = self.kernel.now();
        let mut item = WorkItem::find_for_update(item_id, conn).await?;
        self.verify_active_lease(&item, agent_id)?;

        let mut order = WorkOrder::find_for_update(item.order_id, conn).await?;
        let order_type = self.registry.get(&order.order_type)?;

        order_type
            .partial_rules(&item, part_key, seq, &payload)
            .and_then(|_| order_type.after_validate_part(&item, part_key, &payload))
            .map_err(|errors| WorkError::ValidationFailed { errors })?;

        // The first part marks the item (and its order) as actively worked.
        let actor = Actor::agent(agent_id);
        if item.state == ItemState::Leased {
            let event = self
                .machine
                .transition_item(
                    conn,
                    &mut item,
                    ItemState::InProgress,
                    &actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
        }
        if order.state == OrderState::CheckedOut {
            let event = self
                .machine
                .transition_order(
                    conn,
                    &mut order,
                    OrderState::InProgress,
                    &actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
        }

        let checksum = payload_checksum(&payload);
        let part = WorkItemPart::builder()
            .work_item_id(item.id)
            .part_key(part_key.to_string())
            .status(PartStatus::Validated)
            .payload(payload)
            .checksum(checksum)
            .submitted_by(agent_id.to_string())
            .created_at(now)
            .build();
        let part = WorkItemPart {
            seq,
            evidence,
            notes: notes.clone(),
            ..part
        };
        let part = part.insert(&mut *conn).await?;

        for kind in [EventKind::PartValidated, EventKind::PartSubmitted] {
            let event = self
                .machine
                .record_event(
                    conn,
                    item.order_id,
                    Some(item.id),
                    kind,
                    &actor,
                    now,
                    TransitionOpts::payload(json!({
                        "part_key": part.part_key,
                        "seq": part.seq,
                        "checksum": part.checksum,
                    })),
                )
                .await?;
            events.push(event);
        }

        let latest = WorkItemPart::latest_per_key(item.id, &mut *conn).await?;
        let parts_state = WorkItemPart::summarize(&latest);
        item.parts_state = Some(parts_state.clone());
        item.persist_results(&mut *conn).await?;

        self.kernel.metrics.increment(Counter::PartsSubmitted);

        Ok((part, parts_state))
    }

    /// Store a rejected part after its submit transaction rolled back.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_part_rejection(
        &self,
        item_id: Uuid,
        agent_id: &str,
        part_key: &str,
        seq: Option<i32>,
        payload: Value,
        errors: &[FieldError],
    ) -> Result<()> {
        let now = self.kernel.now();

        let mut tx = self.kernel.db.begin().await?;
        let mut item = WorkItem::find_for_update(item_id, &mut *tx).await?;

        let checksum = payload_checksum(&payload);
        let part = WorkItemPart::builder()
            .work_item_id(item.id)
            .part_key(part_key.to_string())
            .status(PartStatus::Rejected)
            .payload(payload)
            .errors(json!(errors))
            .checksum(checksum)
            .submitted_by(agent_id.to_string())
            .created_at(now)
            .build();
        let part = WorkItemPart { seq, ..part };
        let part = part.insert(&mut *tx).await?;

        let event = self
            .machine
            .record_event(
                &mut *tx,
                item.order_id,
                Some(item.id),
                EventKind::PartRejected,
                &Actor::agent(agent_id),
                now,
                TransitionOpts::payload(json!({
                    "part_key": part.part_key,
                    "seq": part.seq,
                    "errors": errors,
                })),
            )
            .await?;

        let latest = WorkItemPart::latest_per_key(item.id, &mut *tx).await?;
        item.parts_state = Some(WorkItemPart::summarize(&latest));
        item.persist_results(&mut *tx).await?;

        tx.commit().await?;
        self.kernel.bus.emit(event);

        Ok(())
    }

    /// Assemble the latest parts into the item result and submit it.
    pub async fn finalize(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        mode: FinalizeMode,
        actor: &Actor,
        events: &mut Vec<WorkEvent>,
    ) -> Result<WorkItem> {
        let now = self.kernel.now();
        let mut item = WorkItem::find_for_update(item_id, conn).await?;
        let order = WorkOrder::find_for_update(item.order_id, conn).await?;
        let order_type = self.registry.get(&order.order_type)?;

        let latest = WorkItemPart::latest_per_key(item.id, &mut *conn).await?;

        if mode == FinalizeMode::Strict {
            let validated: BTreeSet<&str> = latest
                .iter()
                .filter(|part| part.status == PartStatus::Validated)
                .map(|part| part.part_key.as_str())
                .collect();
            let required: Vec<String> = order_type.required_parts(&item);
            let required_set: BTreeSet<&str> = required.iter().map(String::as_str).collect();

            let mut errors = Vec::new();
            for missing in required_set.difference(&validated) {
                errors.push(FieldError::new(
                    *missing,
                    "missing_part",
                    "required part has no validated submission",
                ));
            }
            for unexpected in validated.difference(&required_set) {
                errors.push(FieldError::new(
                    *unexpected,
                    "unexpected_part",
                    "part is not in the required set",
                ));
            }
            if !errors.is_empty() {
                return Err(WorkError::ValidationFailed { errors });
            }
        }

        let assembled = order_type.assemble(&item, &latest)?;
        order_type
            .validate_assembled(&item, &assembled)
            .map_err(|errors| WorkError::ValidationFailed { errors })?;

        item.assembled_result = Some(assembled.clone());
        item.result = Some(assembled.clone());
        item.persist_results(&mut *conn).await?;

        let event = self
            .machine
            .record_event(
                conn,
                item.order_id,
                Some(item.id),
                EventKind::Finalized,
                actor,
                now,
                TransitionOpts::payload(json!({
                    "mode": match mode {
                        FinalizeMode::Strict => "strict",
                        FinalizeMode::BestEffort => "best_effort",
                    },
                    "assembled_result": assembled,
                })),
            )
            .await?;
        events.push(event);

        let event = self
            .machine
            .transition_item(
                conn,
                &mut item,
                ItemState::Submitted,
                actor,
                now,
                TransitionOpts::default(),
            )
            .await?;
        events.push(event);

        self.kernel.metrics.increment(Counter::ItemsFinalized);

        self.settle_order_after_submission(conn, order, actor, events)
            .await?;

        Ok(item)
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    fn verify_active_lease(&self, item: &WorkItem, agent_id: &str) -> Result<()> {
        let now = self.kernel.now();

        if item.leased_by_agent_id.as_deref() != Some(agent_id) {
            return Err(WorkError::LeaseConflict { item_id: item.id });
        }
        if item.lease_is_expired(now) {
            return Err(WorkError::LeaseExpired { item_id: item.id });
        }
        if !matches!(item.state, ItemState::Leased | ItemState::InProgress) {
            return Err(WorkError::LeaseConflict { item_id: item.id });
        }

        Ok(())
    }

    /// Move the order to submitted once every item has settled, then fire
    /// auto-approval when the type opts in and the policy agrees.
    async fn settle_order_after_submission(
        &self,
        conn: &mut PgConnection,
        mut order: WorkOrder,
        actor: &Actor,
        events: &mut Vec<WorkEvent>,
    ) -> Result<()> {
        let now = self.kernel.now();
        let unsettled = WorkItem::count_unsettled_for_order(order.id, &mut *conn).await?;
        if unsettled > 0 {
            return Ok(());
        }

        if matches!(
            order.state,
            OrderState::CheckedOut | OrderState::InProgress
        ) {
            let event = self
                .machine
                .transition_order(
                    conn,
                    &mut order,
                    OrderState::Submitted,
                    actor,
                    now,
                    TransitionOpts::default(),
                )
                .await?;
            events.push(event);
        }

        let order_type = self.registry.get(&order.order_type)?;
        if order.state == OrderState::Submitted && order_type.auto_approve() {
            let items = WorkItem::find_for_order(order.id, &mut *conn).await?;
            if order_type
                .acceptance_policy()
                .ready_for_approval(&order, &items)
            {
                self.approve(conn, order.id, &Actor::system("auto-approve"), events)
                    .await?;
            }
        }

        Ok(())
    }
}

fn apply_failed(order_id: Uuid, error: WorkError) -> WorkError {
    match error {
        already @ WorkError::ApplyFailed { .. } => already,
        other => WorkError::ApplyFailed {
            order_id,
            message: other.to_string(),
        },
    }
}
