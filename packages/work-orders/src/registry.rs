//! Registry mapping `type_id` strings to order type instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Result, WorkError};
use crate::model::{Diff, WorkOrder};
use crate::order_type::{
    AcceptancePolicy, AcceptanceRule, ApplyContext, ItemSpec, OrderType, RulePolicy,
};

/// Read-mostly map from type id to contract instance, populated at boot.
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<&'static str, Arc<dyn OrderType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    pub fn register(&mut self, order_type: Arc<dyn OrderType>) -> &mut Self {
        self.types.insert(order_type.type_id(), order_type);
        self
    }

    pub fn get(&self, type_id: &str) -> Result<Arc<dyn OrderType>> {
        self.types
            .get(type_id)
            .cloned()
            .ok_or_else(|| WorkError::OrderTypeNotFound {
                type_id: type_id.to_string(),
            })
    }

    pub fn is_registered(&self, type_id: &str) -> bool {
        self.types.contains_key(type_id)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.types.keys().copied().collect()
    }
}

// ============================================================================
// Echo order type
// ============================================================================

/// Reference order type: echoes its payload back through one item.
///
/// Exercises the whole pipeline without external dependencies, which also
/// makes it the workhorse of the integration suite.
pub struct EchoOrderType {
    auto_approve: bool,
}

impl EchoOrderType {
    pub fn new() -> Self {
        Self {
            auto_approve: false,
        }
    }

    pub fn auto_approving() -> Self {
        Self { auto_approve: true }
    }
}

impl Default for EchoOrderType {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderType for EchoOrderType {
    fn type_id(&self) -> &'static str {
        "echo"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["message"],
            "properties": {
                "message": {"type": "string", "minLength": 1, "maxLength": 500}
            }
        })
    }

    async fn plan(&self, order: &WorkOrder) -> Result<Vec<ItemSpec>> {
        let message = order.payload.get("message").cloned().unwrap_or(Value::Null);
        Ok(vec![ItemSpec::new("echo", json!({"message": message}))])
    }

    fn acceptance_policy(&self) -> Arc<dyn AcceptancePolicy> {
        Arc::new(RulePolicy::new(vec![
            AcceptanceRule::equals("ok", json!(true)),
            AcceptanceRule::equals("verified", json!(true)),
            AcceptanceRule::present("echoed_message"),
        ]))
    }

    async fn apply(&self, ctx: ApplyContext<'_>) -> Result<Diff> {
        let mut after = serde_json::Map::new();
        for item in ctx.items {
            if let Some(result) = &item.result {
                after.insert(item.id.to_string(), result.clone());
            }
        }

        let diff = Diff::between(serde_json::Map::new(), after).with_summary(format!(
            "Applied echo order with {} items",
            ctx.items.len()
        ));
        Ok(diff)
    }

    fn auto_approve(&self) -> bool {
        self.auto_approve
    }
}
