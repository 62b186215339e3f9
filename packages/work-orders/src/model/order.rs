//! Order model and its store queries.
//!
//! `state` and the lifecycle timestamp columns are written exclusively by the
//! state machine; everything else is set at insert time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::id::db_id;
use crate::error::{Result, WorkError};

use super::states::{ActorKind, OrderState};

const ORDER_COLUMNS: &str = "id, order_type, state, priority, payload, meta, \
     requested_by_kind, requested_by_id, created_at, last_transitioned_at, \
     applied_at, completed_at";

/// A unit of intent: a request to perform some change, planned into items.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkOrder {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub order_type: String,
    #[builder(default)]
    pub state: OrderState,
    #[builder(default = 0)]
    pub priority: i32,

    pub payload: Value,
    #[builder(default, setter(strip_option))]
    pub meta: Option<Value>,

    pub requested_by_kind: ActorKind,
    pub requested_by_id: String,

    pub created_at: DateTime<Utc>,
    pub last_transitioned_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub applied_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkOrder {
    pub async fn find_by_id(id: Uuid, conn: &mut PgConnection) -> Result<Self> {
        let order = sqlx::query_as::<_, Self>(&format!(
            "SELECT {ORDER_COLUMNS} FROM work_orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(WorkError::NotFound {
            entity: "order",
            id,
        })?;

        Ok(order)
    }

    /// Load with a row lock, serializing concurrent transitions on the order.
    pub async fn find_for_update(id: Uuid, conn: &mut PgConnection) -> Result<Self> {
        let order = sqlx::query_as::<_, Self>(&format!(
            "SELECT {ORDER_COLUMNS} FROM work_orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(WorkError::NotFound {
            entity: "order",
            id,
        })?;

        Ok(order)
    }

    pub async fn insert(&self, conn: &mut PgConnection) -> Result<Self> {
        let order = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO work_orders (
                id, order_type, state, priority, payload, meta,
                requested_by_kind, requested_by_id,
                created_at, last_transitioned_at, applied_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.order_type)
        .bind(self.state)
        .bind(self.priority)
        .bind(&self.payload)
        .bind(&self.meta)
        .bind(self.requested_by_kind)
        .bind(&self.requested_by_id)
        .bind(self.created_at)
        .bind(self.last_transitioned_at)
        .bind(self.applied_at)
        .bind(self.completed_at)
        .fetch_one(conn)
        .await?;

        Ok(order)
    }

    /// Write the state columns after a validated transition.
    ///
    /// Only the state machine calls this.
    pub(crate) async fn persist_transition(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE work_orders
            SET state = $1,
                last_transitioned_at = $2,
                applied_at = $3,
                completed_at = $4
            WHERE id = $5
            "#,
        )
        .bind(self.state)
        .bind(self.last_transitioned_at)
        .bind(self.applied_at)
        .bind(self.completed_at)
        .bind(self.id)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Orders sitting in `failed` since before the cutoff.
    pub async fn find_failed_before(
        cutoff: DateTime<Utc>,
        limit: i64,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>> {
        let orders = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM work_orders
            WHERE state = 'failed' AND last_transitioned_at < $1
            ORDER BY last_transitioned_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(orders)
    }

    /// Ids of non-terminal orders created before the cutoff.
    pub async fn find_stale_ids(
        cutoff: DateTime<Utc>,
        limit: i64,
        conn: &mut PgConnection,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM work_orders
            WHERE state NOT IN ('completed', 'dead_lettered')
              AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(ids)
    }
}
