//! Provenance: audit metadata captured per mutating request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::id::db_id;
use crate::error::Result;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkProvenance {
    #[builder(default = db_id())]
    pub id: Uuid,

    #[builder(default, setter(strip_option))]
    pub order_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub item_id: Option<Uuid>,

    pub agent_id: String,
    #[builder(default, setter(strip_option))]
    pub agent_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub agent_version: Option<String>,

    pub request_fingerprint: String,
    #[builder(default, setter(strip_option))]
    pub idempotency_key_hash: Option<String>,
    #[builder(default, setter(strip_option))]
    pub extra: Option<Value>,

    pub created_at: DateTime<Utc>,
}

impl WorkProvenance {
    pub async fn insert(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO work_provenances (
                id, order_id, item_id, agent_id, agent_name, agent_version,
                request_fingerprint, idempotency_key_hash, extra, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(self.id)
        .bind(self.order_id)
        .bind(self.item_id)
        .bind(&self.agent_id)
        .bind(&self.agent_name)
        .bind(&self.agent_version)
        .bind(&self.request_fingerprint)
        .bind(&self.idempotency_key_hash)
        .bind(&self.extra)
        .bind(self.created_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub async fn find_for_order(order_id: Uuid, conn: &mut PgConnection) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, order_id, item_id, agent_id, agent_name, agent_version,
                   request_fingerprint, idempotency_key_hash, extra, created_at
            FROM work_provenances
            WHERE order_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(conn)
        .await?;

        Ok(rows)
    }
}
