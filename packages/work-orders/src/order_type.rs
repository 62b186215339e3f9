//! The contract an order type must satisfy.
//!
//! Order types are registered behind `Arc<dyn OrderType>` and looked up by
//! their `type_id` string. The required operations define planning,
//! validation, and the apply step; optional hooks have working defaults so a
//! minimal type stays small.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgConnection;

use crate::error::{FieldError, Result, WorkError};
use crate::model::states::PartStatus;
use crate::model::{Diff, WorkItem, WorkItemPart, WorkOrder};

/// Specification of one item produced by `OrderType::plan`.
#[derive(Debug, Clone)]
pub struct ItemSpec {
    pub item_type: String,
    pub input: Value,
    pub max_attempts: Option<i32>,
    pub parts_required: Option<Vec<String>>,
}

impl ItemSpec {
    pub fn new(item_type: impl Into<String>, input: Value) -> Self {
        Self {
            item_type: item_type.into(),
            input,
            max_attempts: None,
            parts_required: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_parts_required(mut self, parts: Vec<String>) -> Self {
        self.parts_required = Some(parts);
        self
    }
}

/// Everything an apply step may touch: the order, its items, and the open
/// transaction, so domain writes land atomically with the state change.
pub struct ApplyContext<'a> {
    pub conn: &'a mut PgConnection,
    pub order: &'a WorkOrder,
    pub items: &'a [WorkItem],
}

/// Review rules for submissions and approval readiness.
pub trait AcceptancePolicy: Send + Sync {
    /// Validate a submitted result. Errors carry field-level detail.
    fn validate_submission(&self, item: &WorkItem, result: &Value) -> Result<(), Vec<FieldError>>;

    /// Whether the order is ready for approval.
    fn ready_for_approval(&self, order: &WorkOrder, items: &[WorkItem]) -> bool;
}

/// A field/predicate pair consumed by `RulePolicy`.
pub struct AcceptanceRule {
    pub field: String,
    pub code: String,
    pub message: String,
    pub predicate: Box<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl AcceptanceRule {
    pub fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
            predicate: Box::new(predicate),
        }
    }

    /// Require the field to equal an exact value.
    pub fn equals(field: impl Into<String> + Clone, expected: Value) -> Self {
        let name = field.clone().into();
        Self::new(
            field,
            "mismatch",
            format!("{name} must equal {expected}"),
            move |v| *v == expected,
        )
    }

    /// Require the field to be present and non-null.
    pub fn present(field: impl Into<String>) -> Self {
        Self::new(field, "required", "field is required", |v| !v.is_null())
    }
}

/// Concrete acceptance policy built from a rule list.
///
/// Readiness holds once the order has at least one item and every item has
/// settled into submitted/accepted/completed.
pub struct RulePolicy {
    rules: Vec<AcceptanceRule>,
}

impl RulePolicy {
    pub fn new(rules: Vec<AcceptanceRule>) -> Self {
        Self { rules }
    }

    /// A policy that accepts anything.
    pub fn permissive() -> Self {
        Self { rules: Vec::new() }
    }
}

impl AcceptancePolicy for RulePolicy {
    fn validate_submission(&self, _item: &WorkItem, result: &Value) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        for rule in &self.rules {
            let value = result.get(&rule.field).unwrap_or(&Value::Null);
            if !(rule.predicate)(value) {
                errors.push(FieldError::new(&rule.field, &rule.code, &rule.message));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn ready_for_approval(&self, _order: &WorkOrder, items: &[WorkItem]) -> bool {
        !items.is_empty()
            && items.iter().all(|item| {
                matches!(
                    item.state,
                    crate::model::ItemState::Submitted
                        | crate::model::ItemState::Accepted
                        | crate::model::ItemState::Completed
                )
            })
    }
}

/// The registered contract for one order type.
#[async_trait]
pub trait OrderType: Send + Sync {
    /// Registry key for this type.
    fn type_id(&self) -> &'static str;

    /// Schema the proposal payload must satisfy (see `schema::validate`).
    fn schema(&self) -> Value;

    /// Plan a proposed order into item specs.
    async fn plan(&self, order: &WorkOrder) -> Result<Vec<ItemSpec>>;

    /// The review rules applied to submissions and approvals.
    fn acceptance_policy(&self) -> Arc<dyn AcceptancePolicy>;

    /// Perform the downstream domain change. MUST be idempotent: a second
    /// invocation on an already-applied order yields an empty or equivalent
    /// diff.
    async fn apply(&self, ctx: ApplyContext<'_>) -> Result<Diff>;

    /// Approve as `system` the moment the policy reports readiness.
    fn auto_approve(&self) -> bool {
        false
    }

    async fn before_apply(&self, _order: &WorkOrder) -> Result<()> {
        Ok(())
    }

    async fn after_apply(&self, _order: &WorkOrder, _diff: &Diff) -> Result<()> {
        Ok(())
    }

    /// Validate one partial submission before it is stored.
    fn partial_rules(
        &self,
        _item: &WorkItem,
        _part_key: &str,
        _seq: Option<i32>,
        _payload: &Value,
    ) -> Result<(), Vec<FieldError>> {
        Ok(())
    }

    /// Hook running after `partial_rules` passed.
    fn after_validate_part(
        &self,
        _item: &WorkItem,
        _part_key: &str,
        _payload: &Value,
    ) -> Result<(), Vec<FieldError>> {
        Ok(())
    }

    /// Part keys a strict finalize must see validated.
    fn required_parts(&self, item: &WorkItem) -> Vec<String> {
        item.parts_required.clone().unwrap_or_default()
    }

    /// Combine the latest parts into the item result. The default merges
    /// validated part payloads by key.
    fn assemble(&self, _item: &WorkItem, latest: &[WorkItemPart]) -> Result<Value> {
        let mut assembled = serde_json::Map::new();
        for part in latest {
            if part.status == PartStatus::Validated {
                assembled.insert(part.part_key.clone(), part.payload.clone());
            }
        }
        Ok(Value::Object(assembled))
    }

    fn validate_assembled(&self, _item: &WorkItem, _assembled: &Value) -> Result<(), Vec<FieldError>> {
        Ok(())
    }
}

impl fmt::Debug for dyn OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderType").field("type_id", &self.type_id()).finish()
    }
}

/// Shorthand for raising a `ValidationFailed` from rule errors.
pub fn validation_error(errors: Vec<FieldError>) -> WorkError {
    WorkError::ValidationFailed { errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id::db_id;
    use crate::model::ItemState;
    use chrono::Utc;
    use serde_json::json;

    fn item_in(state: ItemState) -> WorkItem {
        let mut item = WorkItem::builder()
            .order_id(db_id())
            .item_type("echo".to_string())
            .input(json!({}))
            .created_at(Utc::now())
            .build();
        item.state = state;
        item
    }

    fn order() -> WorkOrder {
        WorkOrder::builder()
            .order_type("echo".to_string())
            .payload(json!({}))
            .requested_by_kind(crate::model::ActorKind::User)
            .requested_by_id("u1".to_string())
            .created_at(Utc::now())
            .last_transitioned_at(Utc::now())
            .build()
    }

    #[test]
    fn rule_policy_reports_each_failing_field() {
        let policy = RulePolicy::new(vec![
            AcceptanceRule::equals("ok", json!(true)),
            AcceptanceRule::present("echoed_message"),
        ]);
        let item = item_in(ItemState::Leased);

        let errors = policy
            .validate_submission(&item, &json!({"ok": false}))
            .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "ok");
        assert_eq!(errors[1].field, "echoed_message");

        assert!(policy
            .validate_submission(&item, &json!({"ok": true, "echoed_message": "hi"}))
            .is_ok());
    }

    #[test]
    fn readiness_requires_every_item_settled() {
        let policy = RulePolicy::permissive();
        let order = order();

        assert!(!policy.ready_for_approval(&order, &[]));
        assert!(!policy.ready_for_approval(
            &order,
            &[item_in(ItemState::Submitted), item_in(ItemState::Leased)]
        ));
        assert!(policy.ready_for_approval(
            &order,
            &[item_in(ItemState::Submitted), item_in(ItemState::Accepted)]
        ));
    }
}
