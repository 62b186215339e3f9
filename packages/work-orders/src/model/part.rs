//! Partial submissions: incremental pieces of an item's result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::id::db_id;
use crate::error::Result;

use super::states::PartStatus;

const PART_COLUMNS: &str = "id, work_item_id, part_key, seq, status, payload, evidence, \
     notes, errors, checksum, submitted_by, created_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkItemPart {
    #[builder(default = db_id())]
    pub id: Uuid,

    pub work_item_id: Uuid,
    pub part_key: String,
    #[builder(default, setter(strip_option))]
    pub seq: Option<i32>,
    #[builder(default)]
    pub status: PartStatus,

    pub payload: Value,
    #[builder(default, setter(strip_option))]
    pub evidence: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub notes: Option<String>,
    #[builder(default, setter(strip_option))]
    pub errors: Option<Value>,

    pub checksum: String,
    pub submitted_by: String,

    pub created_at: DateTime<Utc>,
}

impl WorkItemPart {
    pub async fn insert(&self, conn: &mut PgConnection) -> Result<Self> {
        let part = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO work_item_parts (
                id, work_item_id, part_key, seq, status, payload, evidence,
                notes, errors, checksum, submitted_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {PART_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.work_item_id)
        .bind(&self.part_key)
        .bind(self.seq)
        .bind(self.status)
        .bind(&self.payload)
        .bind(&self.evidence)
        .bind(&self.notes)
        .bind(&self.errors)
        .bind(&self.checksum)
        .bind(&self.submitted_by)
        .bind(self.created_at)
        .fetch_one(conn)
        .await?;

        Ok(part)
    }

    /// All parts of an item, optionally narrowed by key or status.
    pub async fn find_for_item(
        item_id: Uuid,
        part_key: Option<&str>,
        status: Option<PartStatus>,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>> {
        let parts = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {PART_COLUMNS}
            FROM work_item_parts
            WHERE work_item_id = $1
              AND ($2::TEXT IS NULL OR part_key = $2)
              AND ($3::work_part_status IS NULL OR status = $3)
            ORDER BY part_key ASC, seq ASC NULLS LAST, id ASC
            "#
        ))
        .bind(item_id)
        .bind(part_key)
        .bind(status)
        .fetch_all(conn)
        .await?;

        Ok(parts)
    }

    /// The latest part per key: greatest `seq` with NULL sorting last,
    /// tiebreak greatest id.
    pub async fn latest_per_key(item_id: Uuid, conn: &mut PgConnection) -> Result<Vec<Self>> {
        let parts = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT DISTINCT ON (part_key) {PART_COLUMNS}
            FROM work_item_parts
            WHERE work_item_id = $1
            ORDER BY part_key ASC, seq DESC NULLS LAST, id DESC
            "#
        ))
        .bind(item_id)
        .fetch_all(conn)
        .await?;

        Ok(parts)
    }

    /// Summarize latest part progress as the item's `parts_state` document.
    pub fn summarize(latest: &[Self]) -> Value {
        let mut summary = serde_json::Map::new();
        for part in latest {
            summary.insert(
                part.part_key.clone(),
                serde_json::json!({
                    "status": part.status,
                    "seq": part.seq,
                }),
            );
        }
        Value::Object(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn part(key: &str, seq: Option<i32>, status: PartStatus) -> WorkItemPart {
        WorkItemPart {
            id: db_id(),
            work_item_id: db_id(),
            part_key: key.to_string(),
            seq,
            status,
            payload: json!({"k": key}),
            evidence: None,
            notes: None,
            errors: None,
            checksum: "0".repeat(64),
            submitted_by: "a1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn summarize_maps_key_to_status_and_seq() {
        let latest = vec![
            part("research", Some(2), PartStatus::Validated),
            part("analysis", None, PartStatus::Rejected),
        ];
        let summary = WorkItemPart::summarize(&latest);
        assert_eq!(summary["research"]["status"], "validated");
        assert_eq!(summary["research"]["seq"], 2);
        assert_eq!(summary["analysis"]["status"], "rejected");
        assert_eq!(summary["analysis"]["seq"], Value::Null);
    }

    #[test]
    fn new_part_defaults_to_draft() {
        let p = WorkItemPart::builder()
            .work_item_id(db_id())
            .part_key("research".to_string())
            .payload(json!({}))
            .checksum("c".to_string())
            .submitted_by("a1".to_string())
            .created_at(Utc::now())
            .build();
        assert_eq!(p.status, PartStatus::Draft);
        assert!(p.seq.is_none());
    }
}
