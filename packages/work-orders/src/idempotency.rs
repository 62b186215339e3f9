//! Idempotency guard: at-most-once execution per (scope, key).
//!
//! The guard runs inside the caller's transaction. `check` inserts a claim
//! row for the hashed key; the unique index on (scope, key_hash) makes a
//! concurrent caller with the same key block on our insert until we commit
//! or roll back, which serializes execution. A cached response is returned
//! unchanged without comparing payloads: the first writer wins.
//!
//! On operation failure the transaction rolls back and the claim row
//! disappears with it, so a later retry with the same key may succeed.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use crate::common::hash::hash_idempotency_key;
use crate::common::id::db_id;
use crate::error::{Result, WorkError};

pub struct IdempotencyGuard;

impl IdempotencyGuard {
    /// Build the scope qualifier for an operation on an entity.
    pub fn scope(operation: &str, entity: &str) -> String {
        format!("{operation}:{entity}")
    }

    pub fn item_scope(operation: &str, item_id: Uuid) -> String {
        format!("{operation}:item:{item_id}")
    }

    pub fn order_scope(operation: &str, order_id: Uuid) -> String {
        format!("{operation}:order:{order_id}")
    }

    /// Resolve a required key, hashing it for storage.
    pub fn require_key(operation: &str, key: Option<&str>) -> Result<String> {
        match key {
            Some(key) if !key.is_empty() => Ok(hash_idempotency_key(key)),
            _ => Err(WorkError::IdempotencyKeyRequired {
                operation: operation.to_string(),
            }),
        }
    }

    /// Claim the (scope, key_hash) slot inside the current transaction.
    ///
    /// Returns the cached response when a previous caller already completed
    /// under this key; `None` means this transaction now owns the claim and
    /// must call `store` before committing.
    pub async fn check(
        conn: &mut PgConnection,
        scope: &str,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>> {
        sqlx::query(
            r#"
            INSERT INTO work_idempotency_keys (id, scope, key_hash, response, created_at)
            VALUES ($1, $2, $3, NULL, $4)
            ON CONFLICT (scope, key_hash) DO NOTHING
            "#,
        )
        .bind(db_id())
        .bind(scope)
        .bind(key_hash)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let response = sqlx::query_scalar::<_, Option<Value>>(
            r#"
            SELECT response
            FROM work_idempotency_keys
            WHERE scope = $1 AND key_hash = $2
            FOR UPDATE
            "#,
        )
        .bind(scope)
        .bind(key_hash)
        .fetch_one(&mut *conn)
        .await?;

        Ok(response)
    }

    /// Persist the response snapshot for the claim taken by `check`.
    pub async fn store(
        conn: &mut PgConnection,
        scope: &str,
        key_hash: &str,
        response: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE work_idempotency_keys
            SET response = $1
            WHERE scope = $2 AND key_hash = $3
            "#,
        )
        .bind(response)
        .bind(scope)
        .bind(key_hash)
        .execute(conn)
        .await?;

        Ok(())
    }
}
