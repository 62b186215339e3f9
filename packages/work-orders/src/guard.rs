//! Direct-mutation guard.
//!
//! Callers that funnel every domain change through work orders can use this
//! interceptor to reject writes that arrive without an order in an allowed
//! state.

use sqlx::postgres::PgConnection;
use uuid::Uuid;

use crate::error::{Result, WorkError};
use crate::model::states::OrderState;
use crate::model::WorkOrder;

/// States during which a domain mutation is legitimate: the order has been
/// reviewed and is being (or has just been) applied.
pub const DEFAULT_MUTABLE_STATES: &[OrderState] = &[OrderState::Approved, OrderState::Applied];

pub struct MutationGuard {
    allowed: Vec<OrderState>,
}

impl MutationGuard {
    pub fn new() -> Self {
        Self {
            allowed: DEFAULT_MUTABLE_STATES.to_vec(),
        }
    }

    pub fn with_allowed_states(allowed: Vec<OrderState>) -> Self {
        Self { allowed }
    }

    /// Authorize a domain mutation claiming to act for `order_id`.
    ///
    /// Returns the order when it exists and is in an allowed state; rejects
    /// with `ForbiddenDirectMutation` otherwise.
    pub async fn authorize(
        &self,
        conn: &mut PgConnection,
        order_id: Option<Uuid>,
    ) -> Result<WorkOrder> {
        let Some(order_id) = order_id else {
            return Err(WorkError::ForbiddenDirectMutation {
                reason: "mutation carries no work order id".to_string(),
            });
        };

        let order = match WorkOrder::find_by_id(order_id, conn).await {
            Ok(order) => order,
            Err(WorkError::NotFound { .. }) => {
                return Err(WorkError::ForbiddenDirectMutation {
                    reason: format!("work order {order_id} does not exist"),
                });
            }
            Err(other) => return Err(other),
        };

        if !self.allowed.contains(&order.state) {
            return Err(WorkError::ForbiddenDirectMutation {
                reason: format!(
                    "work order {order_id} is {}, not in an allowed state",
                    order.state
                ),
            });
        }

        tracing::debug!(order_id = %order_id, state = %order.state, "direct mutation authorized");

        Ok(order)
    }
}

impl Default for MutationGuard {
    fn default() -> Self {
        Self::new()
    }
}
