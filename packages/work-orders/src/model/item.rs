//! Item model: the leasable, agent-executable unit of an order.
//!
//! Column ownership is split: the state machine writes `state` and
//! `accepted_at`, the lease engine writes the lease columns and `attempts`,
//! and the executor writes `result`, `assembled_result`, `parts_state`, and
//! `error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::id::db_id;
use crate::error::{Result, WorkError};

use super::states::ItemState;

const ITEM_COLUMNS: &str = "id, order_id, item_type, state, attempts, max_attempts, input, \
     result, assembled_result, parts_required, parts_state, error, \
     leased_by_agent_id, lease_expires_at, last_heartbeat_at, accepted_at, created_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkItem {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub order_id: Uuid,
    pub item_type: String,
    #[builder(default)]
    pub state: ItemState,

    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,

    pub input: Value,
    #[builder(default, setter(strip_option))]
    pub result: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub assembled_result: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub parts_required: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    pub parts_state: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<Value>,

    #[builder(default, setter(strip_option))]
    pub leased_by_agent_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub accepted_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Whether the item currently holds a live lease for `agent_id`.
    pub fn lease_held_by(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.leased_by_agent_id.as_deref() == Some(agent_id)
            && self.lease_expires_at.map(|at| at > now).unwrap_or(false)
    }

    pub fn lease_is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Drop the in-memory lease columns. Terminal items must never carry a
    /// lease, so the state machine calls this on terminal transitions.
    pub(crate) fn clear_lease_fields(&mut self) {
        self.leased_by_agent_id = None;
        self.lease_expires_at = None;
        self.last_heartbeat_at = None;
    }

    pub async fn find_by_id(id: Uuid, conn: &mut PgConnection) -> Result<Self> {
        let item = sqlx::query_as::<_, Self>(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(WorkError::NotFound {
            entity: "item",
            id,
        })?;

        Ok(item)
    }

    /// Load with a row lock; every state-changing lease or executor operation
    /// starts here.
    pub async fn find_for_update(id: Uuid, conn: &mut PgConnection) -> Result<Self> {
        let item = sqlx::query_as::<_, Self>(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(WorkError::NotFound {
            entity: "item",
            id,
        })?;

        Ok(item)
    }

    pub async fn insert(&self, conn: &mut PgConnection) -> Result<Self> {
        let item = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO work_items (
                id, order_id, item_type, state, attempts, max_attempts, input,
                result, assembled_result, parts_required, parts_state, error,
                leased_by_agent_id, lease_expires_at, last_heartbeat_at,
                accepted_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.order_id)
        .bind(&self.item_type)
        .bind(self.state)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(&self.input)
        .bind(&self.result)
        .bind(&self.assembled_result)
        .bind(&self.parts_required)
        .bind(&self.parts_state)
        .bind(&self.error)
        .bind(&self.leased_by_agent_id)
        .bind(self.lease_expires_at)
        .bind(self.last_heartbeat_at)
        .bind(self.accepted_at)
        .bind(self.created_at)
        .fetch_one(conn)
        .await?;

        Ok(item)
    }

    pub async fn find_for_order(order_id: Uuid, conn: &mut PgConnection) -> Result<Vec<Self>> {
        let items = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM work_items
            WHERE order_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(order_id)
        .fetch_all(conn)
        .await?;

        Ok(items)
    }

    pub async fn count_for_order(order_id: Uuid, conn: &mut PgConnection) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM work_items WHERE order_id = $1")
                .bind(order_id)
                .fetch_one(conn)
                .await?;

        Ok(count)
    }

    /// Items of an order still outside {submitted, accepted, completed}.
    pub async fn count_unsettled_for_order(
        order_id: Uuid,
        conn: &mut PgConnection,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM work_items
            WHERE order_id = $1
              AND state NOT IN ('submitted', 'accepted', 'completed')
            "#,
        )
        .bind(order_id)
        .fetch_one(conn)
        .await?;

        Ok(count)
    }

    /// Items of an order still held or being worked by some agent.
    pub async fn count_active_for_order(order_id: Uuid, conn: &mut PgConnection) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM work_items
            WHERE order_id = $1
              AND state IN ('leased', 'in_progress')
            "#,
        )
        .bind(order_id)
        .fetch_one(conn)
        .await?;

        Ok(count)
    }

    /// Items of an order not yet terminal-successful.
    pub async fn count_not_completed_for_order(
        order_id: Uuid,
        conn: &mut PgConnection,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM work_items
            WHERE order_id = $1 AND state <> 'completed'
            "#,
        )
        .bind(order_id)
        .fetch_one(conn)
        .await?;

        Ok(count)
    }

    /// Ids of items whose lease has expired while leased or in progress.
    pub async fn find_expired_lease_ids(
        now: DateTime<Utc>,
        limit: i64,
        conn: &mut PgConnection,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM work_items
            WHERE state IN ('leased', 'in_progress')
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < $1
            ORDER BY lease_expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(ids)
    }

    /// Items sitting in `failed` since before the cutoff.
    pub async fn find_failed_before(
        cutoff: DateTime<Utc>,
        limit: i64,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>> {
        let items = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM work_items i
            WHERE i.state = 'failed'
              AND EXISTS (
                  SELECT 1 FROM work_events e
                  WHERE e.item_id = i.id AND e.event = 'failed' AND e.created_at < $1
              )
            ORDER BY i.created_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(items)
    }

    /// Write state and `accepted_at` after a validated transition.
    ///
    /// Only the state machine calls this.
    pub(crate) async fn persist_transition(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE work_items
            SET state = $1,
                accepted_at = $2
            WHERE id = $3
            "#,
        )
        .bind(self.state)
        .bind(self.accepted_at)
        .bind(self.id)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Set the lease columns. Only the lease engine calls this.
    pub(crate) async fn persist_lease(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE work_items
            SET leased_by_agent_id = $1,
                lease_expires_at = $2,
                last_heartbeat_at = $3,
                attempts = $4
            WHERE id = $5
            "#,
        )
        .bind(&self.leased_by_agent_id)
        .bind(self.lease_expires_at)
        .bind(self.last_heartbeat_at)
        .bind(self.attempts)
        .bind(self.id)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Set the executor-owned result columns.
    pub(crate) async fn persist_results(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE work_items
            SET result = $1,
                assembled_result = $2,
                parts_state = $3,
                error = $4
            WHERE id = $5
            "#,
        )
        .bind(&self.result)
        .bind(&self.assembled_result)
        .bind(&self.parts_state)
        .bind(&self.error)
        .bind(self.id)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Accept every submitted item of the order in bulk, stamping
    /// `accepted_at`. Returns the accepted item ids.
    pub(crate) async fn accept_submitted_for_order(
        order_id: Uuid,
        accepted_at: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE work_items
            SET state = 'accepted',
                accepted_at = $1,
                leased_by_agent_id = NULL,
                lease_expires_at = NULL,
                last_heartbeat_at = NULL
            WHERE order_id = $2 AND state = 'submitted'
            RETURNING id
            "#,
        )
        .bind(accepted_at)
        .bind(order_id)
        .fetch_all(conn)
        .await?;

        Ok(ids)
    }

    /// Complete every accepted item of the order in bulk.
    pub(crate) async fn complete_accepted_for_order(
        order_id: Uuid,
        conn: &mut PgConnection,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE work_items
            SET state = 'completed'
            WHERE order_id = $1 AND state = 'accepted'
            RETURNING id
            "#,
        )
        .bind(order_id)
        .fetch_all(conn)
        .await?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_item() -> WorkItem {
        WorkItem::builder()
            .order_id(db_id())
            .item_type("echo".to_string())
            .input(json!({"message": "hi"}))
            .created_at(Utc::now())
            .build()
    }

    #[test]
    fn new_item_starts_queued_with_no_lease() {
        let item = sample_item();
        assert_eq!(item.state, ItemState::Queued);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.max_attempts, 3);
        assert!(item.leased_by_agent_id.is_none());
        assert!(item.lease_expires_at.is_none());
    }

    #[test]
    fn lease_held_by_checks_owner_and_expiry() {
        let now = Utc::now();
        let mut item = sample_item();
        item.leased_by_agent_id = Some("a1".to_string());
        item.lease_expires_at = Some(now + chrono::Duration::seconds(60));

        assert!(item.lease_held_by("a1", now));
        assert!(!item.lease_held_by("a2", now));
        assert!(!item.lease_held_by("a1", now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn lease_expiry_is_inclusive() {
        let now = Utc::now();
        let mut item = sample_item();
        item.lease_expires_at = Some(now);
        assert!(item.lease_is_expired(now));

        item.lease_expires_at = None;
        assert!(!item.lease_is_expired(now));
    }
}
