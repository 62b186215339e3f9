//! Structured error surface for the control plane.
//!
//! `WorkError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Every externally-observable failure mode has its own
//! variant; storage failures are wrapped, not swallowed.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::states::{ItemState, OrderState};

/// A single field-level validation failure.
///
/// `field` is a dotted path into the offending document
/// (e.g. `user.email`, `items.2.quantity`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl FieldError {
    pub fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code)
    }
}

/// Errors raised by the control plane core.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The requested order type is not registered.
    #[error("unknown order type {type_id}")]
    OrderTypeNotFound { type_id: String },

    /// A payload, result, or part failed schema or acceptance validation.
    #[error("validation failed: {}", format_field_errors(.errors))]
    ValidationFailed { errors: Vec<FieldError> },

    /// The state machine rejected a transition.
    #[error("illegal transition from {from} to {to} for {entity}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// The lease is held by another agent, or a checkout race was lost.
    #[error("lease conflict on item {item_id}")]
    LeaseConflict { item_id: Uuid },

    /// The lease on the item has already expired.
    #[error("lease expired on item {item_id}")]
    LeaseExpired { item_id: Uuid },

    /// Checkout found no eligible items.
    #[error("no items available")]
    NoItemsAvailable,

    /// The operation requires an idempotency key and none was provided.
    #[error("idempotency key required for {operation}")]
    IdempotencyKeyRequired { operation: String },

    /// Approval was requested before the acceptance policy reports readiness.
    #[error("order {order_id} is not ready for approval")]
    NotReadyForApproval { order_id: Uuid },

    /// A domain mutation was attempted without a work order in an allowed state.
    #[error("direct mutation forbidden: {reason}")]
    ForbiddenDirectMutation { reason: String },

    /// `OrderType::apply` failed; the surrounding transaction was rolled back.
    #[error("apply failed for order {order_id}: {message}")]
    ApplyFailed { order_id: Uuid, message: String },

    /// An order or item id did not resolve.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Underlying store failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Payload or snapshot (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkError {
    /// Build a `ValidationFailed` from collected field errors.
    pub fn validation(errors: Vec<FieldError>) -> Self {
        WorkError::ValidationFailed { errors }
    }

    pub fn illegal_order_transition(from: OrderState, to: OrderState) -> Self {
        WorkError::IllegalTransition {
            entity: "order",
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn illegal_item_transition(from: ItemState, to: ItemState) -> Self {
        WorkError::IllegalTransition {
            entity: "item",
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            WorkError::OrderTypeNotFound { .. } => "order_type_not_found",
            WorkError::ValidationFailed { .. } => "validation_failed",
            WorkError::IllegalTransition { .. } => "illegal_transition",
            WorkError::LeaseConflict { .. } => "lease_conflict",
            WorkError::LeaseExpired { .. } => "lease_expired",
            WorkError::NoItemsAvailable => "no_items_available",
            WorkError::IdempotencyKeyRequired { .. } => "idempotency_key_required",
            WorkError::NotReadyForApproval { .. } => "not_ready_for_approval",
            WorkError::ForbiddenDirectMutation { .. } => "forbidden_direct_mutation",
            WorkError::ApplyFailed { .. } => "apply_failed",
            WorkError::NotFound { .. } => "not_found",
            WorkError::Storage(_) => "storage_error",
            WorkError::Serialization(_) => "serialization_error",
        }
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = WorkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_all_fields() {
        let err = WorkError::validation(vec![
            FieldError::new("message", "required", "field is required"),
            FieldError::new("count", "minimum", "must be >= 1"),
        ]);
        let text = err.to_string();
        assert!(text.contains("message"));
        assert!(text.contains("count"));
    }

    #[test]
    fn errors_are_pattern_matchable() {
        let err = WorkError::LeaseConflict { item_id: Uuid::nil() };
        match err {
            WorkError::LeaseConflict { item_id } => assert!(item_id.is_nil()),
            _ => panic!("expected LeaseConflict"),
        }
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(WorkError::NoItemsAvailable.code(), "no_items_available");
        assert_eq!(
            WorkError::IdempotencyKeyRequired {
                operation: "propose".into()
            }
            .code(),
            "idempotency_key_required"
        );
    }
}
