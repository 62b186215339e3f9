//! State enums for orders, items, and parts, plus actor identity.

use serde::{Deserialize, Serialize};

use super::event::EventKind;

// ============================================================================
// Order states
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "work_order_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    #[default]
    Queued,
    CheckedOut,
    InProgress,
    Submitted,
    Approved,
    Applied,
    Completed,
    Rejected,
    Failed,
    DeadLettered,
}

impl OrderState {
    /// Terminal orders never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Completed | OrderState::DeadLettered)
    }

    /// Event kind written when an order enters this state.
    pub fn event_kind(&self) -> EventKind {
        match self {
            OrderState::Queued => EventKind::Queued,
            OrderState::CheckedOut => EventKind::CheckedOut,
            OrderState::InProgress => EventKind::InProgress,
            OrderState::Submitted => EventKind::Submitted,
            OrderState::Approved => EventKind::Approved,
            OrderState::Applied => EventKind::Applied,
            OrderState::Completed => EventKind::Completed,
            OrderState::Rejected => EventKind::Rejected,
            OrderState::Failed => EventKind::Failed,
            OrderState::DeadLettered => EventKind::DeadLettered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Queued => "queued",
            OrderState::CheckedOut => "checked_out",
            OrderState::InProgress => "in_progress",
            OrderState::Submitted => "submitted",
            OrderState::Approved => "approved",
            OrderState::Applied => "applied",
            OrderState::Completed => "completed",
            OrderState::Rejected => "rejected",
            OrderState::Failed => "failed",
            OrderState::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OrderState::Queued),
            "checked_out" => Ok(OrderState::CheckedOut),
            "in_progress" => Ok(OrderState::InProgress),
            "submitted" => Ok(OrderState::Submitted),
            "approved" => Ok(OrderState::Approved),
            "applied" => Ok(OrderState::Applied),
            "completed" => Ok(OrderState::Completed),
            "rejected" => Ok(OrderState::Rejected),
            "failed" => Ok(OrderState::Failed),
            "dead_lettered" => Ok(OrderState::DeadLettered),
            other => Err(format!("unknown order state: {other}")),
        }
    }
}

// ============================================================================
// Item states
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "work_item_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    Queued,
    Leased,
    InProgress,
    Submitted,
    Accepted,
    Completed,
    Rejected,
    Failed,
    DeadLettered,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed | ItemState::Rejected | ItemState::DeadLettered
        )
    }

    /// Terminal states that count as successful execution.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, ItemState::Completed)
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            ItemState::Queued => EventKind::Queued,
            ItemState::Leased => EventKind::Leased,
            ItemState::InProgress => EventKind::InProgress,
            ItemState::Submitted => EventKind::Submitted,
            ItemState::Accepted => EventKind::Accepted,
            ItemState::Completed => EventKind::Completed,
            ItemState::Rejected => EventKind::Rejected,
            ItemState::Failed => EventKind::Failed,
            ItemState::DeadLettered => EventKind::DeadLettered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Queued => "queued",
            ItemState::Leased => "leased",
            ItemState::InProgress => "in_progress",
            ItemState::Submitted => "submitted",
            ItemState::Accepted => "accepted",
            ItemState::Completed => "completed",
            ItemState::Rejected => "rejected",
            ItemState::Failed => "failed",
            ItemState::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Part status
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "work_part_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    #[default]
    Draft,
    Validated,
    Rejected,
}

impl PartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartStatus::Draft => "draft",
            PartStatus::Validated => "validated",
            PartStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Actors
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "work_actor_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    #[default]
    Agent,
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::User => "user",
            ActorKind::Agent => "agent",
            ActorKind::System => "system",
        }
    }
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity responsible for a mutation or event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn new(kind: ActorKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(ActorKind::User, id)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(ActorKind::Agent, id)
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self::new(ActorKind::System, id)
    }

    /// The maintenance scheduler identity.
    pub fn scheduler() -> Self {
        Self::system("scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_terminal_states() {
        assert!(OrderState::Completed.is_terminal());
        assert!(OrderState::DeadLettered.is_terminal());
        assert!(!OrderState::Applied.is_terminal());
        assert!(!OrderState::Failed.is_terminal());
    }

    #[test]
    fn item_terminal_states() {
        assert!(ItemState::Completed.is_terminal());
        assert!(ItemState::Rejected.is_terminal());
        assert!(ItemState::DeadLettered.is_terminal());
        assert!(!ItemState::Submitted.is_terminal());
    }

    #[test]
    fn only_completed_items_are_terminal_success() {
        assert!(ItemState::Completed.is_terminal_success());
        assert!(!ItemState::Rejected.is_terminal_success());
        assert!(!ItemState::DeadLettered.is_terminal_success());
    }

    #[test]
    fn order_state_round_trips_through_str() {
        for state in [
            OrderState::Queued,
            OrderState::CheckedOut,
            OrderState::DeadLettered,
        ] {
            assert_eq!(state.as_str().parse::<OrderState>().unwrap(), state);
        }
    }

    #[test]
    fn state_event_kinds_match_names() {
        assert_eq!(OrderState::Applied.event_kind(), EventKind::Applied);
        assert_eq!(ItemState::Leased.event_kind(), EventKind::Leased);
    }
}
