//! State machine: the sole mutator of order and item `state` columns.
//!
//! Transitions are validated against a configurable directed graph, applied
//! together with their timestamp columns and journal event inside the
//! caller's transaction, and handed back as the event to publish after
//! commit.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use crate::error::{Result, WorkError};
use crate::model::states::{Actor, ItemState, OrderState};
use crate::model::{EventKind, WorkEvent, WorkItem, WorkOrder};

// ============================================================================
// Transition graph
// ============================================================================

/// Directed graph of allowed state transitions.
#[derive(Debug, Clone)]
pub struct TransitionGraph<S> {
    allowed: HashMap<S, Vec<S>>,
}

impl<S: Copy + Eq + Hash> TransitionGraph<S> {
    pub fn new(allowed: HashMap<S, Vec<S>>) -> Self {
        Self { allowed }
    }

    pub fn allows(&self, from: S, to: S) -> bool {
        self.allowed
            .get(&from)
            .map(|next| next.contains(&to))
            .unwrap_or(false)
    }

    pub fn allowed_from(&self, from: S) -> &[S] {
        self.allowed.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace the outgoing edges of one state.
    pub fn set_edges(&mut self, from: S, to: Vec<S>) {
        self.allowed.insert(from, to);
    }
}

/// Default order graph: the main path plus rework, release, and failure
/// edges. Terminal states have no outgoing edges.
pub fn default_order_graph() -> TransitionGraph<OrderState> {
    use OrderState::*;

    let mut allowed: HashMap<OrderState, Vec<OrderState>> = HashMap::new();
    allowed.insert(Queued, vec![CheckedOut, InProgress, Rejected, Failed]);
    allowed.insert(CheckedOut, vec![InProgress, Submitted, Queued, Failed]);
    allowed.insert(InProgress, vec![Submitted, Failed]);
    allowed.insert(Submitted, vec![Approved, Rejected, Failed]);
    allowed.insert(Approved, vec![Applied, Failed]);
    allowed.insert(Applied, vec![Completed, Failed]);
    allowed.insert(Rejected, vec![Queued, Failed]);
    allowed.insert(Failed, vec![DeadLettered]);
    allowed.insert(Completed, vec![]);
    allowed.insert(DeadLettered, vec![]);

    TransitionGraph::new(allowed)
}

/// Default item graph: lease cycle, submission, acceptance, and the failure
/// branch.
pub fn default_item_graph() -> TransitionGraph<ItemState> {
    use ItemState::*;

    let mut allowed: HashMap<ItemState, Vec<ItemState>> = HashMap::new();
    allowed.insert(Queued, vec![Leased, Rejected, Failed]);
    allowed.insert(Leased, vec![InProgress, Submitted, Queued, Failed]);
    allowed.insert(InProgress, vec![Submitted, Queued, Failed]);
    allowed.insert(Submitted, vec![Accepted, Rejected, Failed]);
    allowed.insert(Accepted, vec![Completed, Failed]);
    allowed.insert(Rejected, vec![Queued]);
    allowed.insert(Failed, vec![DeadLettered]);
    allowed.insert(Completed, vec![]);
    allowed.insert(DeadLettered, vec![]);

    TransitionGraph::new(allowed)
}

// ============================================================================
// State machine
// ============================================================================

/// Optional extras attached to a transition's journal event.
#[derive(Debug, Default, Clone)]
pub struct TransitionOpts {
    pub payload: Option<Value>,
    pub message: Option<String>,
    pub diff: Option<Value>,
}

impl TransitionOpts {
    pub fn payload(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

pub struct StateMachine {
    orders: TransitionGraph<OrderState>,
    items: TransitionGraph<ItemState>,
}

impl StateMachine {
    pub fn new(orders: TransitionGraph<OrderState>, items: TransitionGraph<ItemState>) -> Self {
        Self { orders, items }
    }

    pub fn order_graph(&self) -> &TransitionGraph<OrderState> {
        &self.orders
    }

    pub fn item_graph(&self) -> &TransitionGraph<ItemState> {
        &self.items
    }

    /// Move an order to `to`, stamping lifecycle timestamps and writing the
    /// journal event in the same transaction. Returns the event for
    /// post-commit publication.
    pub async fn transition_order(
        &self,
        conn: &mut PgConnection,
        order: &mut WorkOrder,
        to: OrderState,
        actor: &Actor,
        now: DateTime<Utc>,
        opts: TransitionOpts,
    ) -> Result<WorkEvent> {
        if !self.orders.allows(order.state, to) {
            return Err(WorkError::illegal_order_transition(order.state, to));
        }

        order.state = to;
        order.last_transitioned_at = now;
        if to == OrderState::Applied && order.applied_at.is_none() {
            order.applied_at = Some(now);
        }
        if to == OrderState::Completed && order.completed_at.is_none() {
            order.completed_at = Some(now);
        }
        order.persist_transition(conn).await?;

        let mut event = WorkEvent::of(order.id, to.event_kind(), actor, now);
        event.payload = opts.payload;
        event.message = opts.message;
        event.diff = opts.diff;
        event.insert(conn).await?;

        tracing::debug!(
            order_id = %order.id,
            state = %to,
            actor = %actor.id,
            "order transitioned"
        );

        Ok(event)
    }

    /// Move an item to `to`. Terminal transitions also drop any remaining
    /// lease columns so a finished item can never look held.
    pub async fn transition_item(
        &self,
        conn: &mut PgConnection,
        item: &mut WorkItem,
        to: ItemState,
        actor: &Actor,
        now: DateTime<Utc>,
        opts: TransitionOpts,
    ) -> Result<WorkEvent> {
        if !self.items.allows(item.state, to) {
            return Err(WorkError::illegal_item_transition(item.state, to));
        }

        item.state = to;
        if to == ItemState::Accepted && item.accepted_at.is_none() {
            item.accepted_at = Some(now);
        }
        item.persist_transition(conn).await?;

        if to.is_terminal() && item.leased_by_agent_id.is_some() {
            item.clear_lease_fields();
            item.persist_lease(conn).await?;
        }

        let mut event = WorkEvent::of(item.order_id, to.event_kind(), actor, now).with_item(item.id);
        event.payload = opts.payload;
        event.message = opts.message;
        event.diff = opts.diff;
        event.insert(conn).await?;

        tracing::debug!(
            item_id = %item.id,
            order_id = %item.order_id,
            state = %to,
            actor = %actor.id,
            "item transitioned"
        );

        Ok(event)
    }

    /// Write a journal event without changing state (heartbeats, lease-expiry
    /// notes, part activity).
    pub async fn record_event(
        &self,
        conn: &mut PgConnection,
        order_id: Uuid,
        item_id: Option<Uuid>,
        kind: EventKind,
        actor: &Actor,
        now: DateTime<Utc>,
        opts: TransitionOpts,
    ) -> Result<WorkEvent> {
        let mut event = WorkEvent::of(order_id, kind, actor, now);
        event.item_id = item_id;
        event.payload = opts.payload;
        event.message = opts.message;
        event.diff = opts.diff;
        event.insert(conn).await?;

        Ok(event)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(default_order_graph(), default_item_graph())
    }
}
