//! Append-only event journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::id::db_id;
use crate::error::Result;

use super::states::{Actor, ActorKind};

/// Kinds of journal entries.
///
/// Most kinds mirror the state an entity entered; the rest record facts that
/// do not change state (heartbeats, part activity, lease expiries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "work_event_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Proposed,
    Planned,
    Queued,
    CheckedOut,
    InProgress,
    Leased,
    Heartbeat,
    LeaseExpired,
    Submitted,
    Accepted,
    Approved,
    Applied,
    Completed,
    Rejected,
    Failed,
    DeadLettered,
    PartSubmitted,
    PartValidated,
    PartRejected,
    Finalized,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Proposed => "proposed",
            EventKind::Planned => "planned",
            EventKind::Queued => "queued",
            EventKind::CheckedOut => "checked_out",
            EventKind::InProgress => "in_progress",
            EventKind::Leased => "leased",
            EventKind::Heartbeat => "heartbeat",
            EventKind::LeaseExpired => "lease_expired",
            EventKind::Submitted => "submitted",
            EventKind::Accepted => "accepted",
            EventKind::Approved => "approved",
            EventKind::Applied => "applied",
            EventKind::Completed => "completed",
            EventKind::Rejected => "rejected",
            EventKind::Failed => "failed",
            EventKind::DeadLettered => "dead_lettered",
            EventKind::PartSubmitted => "part_submitted",
            EventKind::PartValidated => "part_validated",
            EventKind::PartRejected => "part_rejected",
            EventKind::Finalized => "finalized",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One journal row. Only `created_at` is tracked; rows are never updated.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkEvent {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub order_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub item_id: Option<Uuid>,

    pub event: EventKind,
    pub actor_kind: ActorKind,
    pub actor_id: String,

    #[builder(default, setter(strip_option))]
    pub payload: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub diff: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub message: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl WorkEvent {
    /// Start a builder pre-filled from an actor.
    pub fn of(
        order_id: Uuid,
        event: EventKind,
        actor: &Actor,
        created_at: DateTime<Utc>,
    ) -> WorkEvent {
        WorkEvent {
            id: db_id(),
            order_id,
            item_id: None,
            event,
            actor_kind: actor.kind,
            actor_id: actor.id.clone(),
            payload: None,
            diff: None,
            message: None,
            created_at,
        }
    }

    pub fn with_item(mut self, item_id: Uuid) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_diff(mut self, diff: Value) -> Self {
        self.diff = Some(diff);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub async fn insert(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO work_events (
                id, order_id, item_id, event, actor_kind, actor_id,
                payload, diff, message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(self.id)
        .bind(self.order_id)
        .bind(self.item_id)
        .bind(self.event)
        .bind(self.actor_kind)
        .bind(&self.actor_id)
        .bind(&self.payload)
        .bind(&self.diff)
        .bind(&self.message)
        .bind(self.created_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Most recent events for an order, newest first.
    pub async fn find_for_order(
        order_id: Uuid,
        limit: i64,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, order_id, item_id, event, actor_kind, actor_id,
                   payload, diff, message, created_at
            FROM work_events
            WHERE order_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(order_id)
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(events)
    }

    /// Most recent events for an item, newest first.
    pub async fn find_for_item(
        item_id: Uuid,
        limit: i64,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, order_id, item_id, event, actor_kind, actor_id,
                   payload, diff, message, created_at
            FROM work_events
            WHERE item_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(item_id)
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_names_are_snake_case() {
        assert_eq!(EventKind::CheckedOut.as_str(), "checked_out");
        assert_eq!(EventKind::PartValidated.as_str(), "part_validated");
    }

    #[test]
    fn builder_fills_defaults() {
        let actor = Actor::agent("a1");
        let event = WorkEvent::of(db_id(), EventKind::Heartbeat, &actor, Utc::now())
            .with_message("lease extended");
        assert_eq!(event.actor_kind, ActorKind::Agent);
        assert_eq!(event.actor_id, "a1");
        assert!(event.item_id.is_none());
        assert_eq!(event.message.as_deref(), Some("lease extended"));
    }
}
