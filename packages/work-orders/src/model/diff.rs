//! Structural diff produced by `OrderType::apply`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single per-key change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiffChange {
    Added { value: Value },
    Removed { value: Value },
    Modified { from: Value, to: Value },
}

/// Immutable before/after record of an applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub before: Map<String, Value>,
    pub after: Map<String, Value>,
    pub changes: BTreeMap<String, DiffChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Diff {
    /// Compute the diff between two snapshots.
    ///
    /// Keys present only in `after` are `added`, keys present only in
    /// `before` are `removed`, keys in both with structurally different
    /// values are `modified`.
    pub fn between(before: Map<String, Value>, after: Map<String, Value>) -> Self {
        let mut changes = BTreeMap::new();

        for (key, after_value) in &after {
            match before.get(key) {
                None => {
                    changes.insert(
                        key.clone(),
                        DiffChange::Added {
                            value: after_value.clone(),
                        },
                    );
                }
                Some(before_value) if before_value != after_value => {
                    changes.insert(
                        key.clone(),
                        DiffChange::Modified {
                            from: before_value.clone(),
                            to: after_value.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }

        for (key, before_value) in &before {
            if !after.contains_key(key) {
                changes.insert(
                    key.clone(),
                    DiffChange::Removed {
                        value: before_value.clone(),
                    },
                );
            }
        }

        Self {
            before,
            after,
            changes,
            summary: None,
        }
    }

    /// An empty diff, the result of re-applying an already-applied order.
    pub fn empty() -> Self {
        Self {
            before: Map::new(),
            after: Map::new(),
            changes: BTreeMap::new(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn detects_added_removed_and_modified_keys() {
        let before = map(json!({"name": "a", "count": 1, "gone": true}));
        let after = map(json!({"name": "a", "count": 2, "fresh": "x"}));

        let diff = Diff::between(before, after);

        assert_eq!(
            diff.changes.get("count"),
            Some(&DiffChange::Modified {
                from: json!(1),
                to: json!(2)
            })
        );
        assert_eq!(
            diff.changes.get("fresh"),
            Some(&DiffChange::Added { value: json!("x") })
        );
        assert_eq!(
            diff.changes.get("gone"),
            Some(&DiffChange::Removed { value: json!(true) })
        );
        assert!(!diff.changes.contains_key("name"));
    }

    #[test]
    fn identical_snapshots_produce_empty_diff() {
        let snapshot = map(json!({"a": [1, 2, 3], "b": {"nested": true}}));
        let diff = Diff::between(snapshot.clone(), snapshot);
        assert!(diff.is_empty());
    }

    #[test]
    fn values_compare_structurally() {
        let before = map(json!({"obj": {"x": 1, "y": 2}}));
        let after = map(json!({"obj": {"y": 2, "x": 1}}));
        let diff = Diff::between(before, after);
        assert!(diff.is_empty());
    }

    #[test]
    fn change_serialization_carries_type_tag() {
        let change = DiffChange::Modified {
            from: json!(1),
            to: json!(2),
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "modified");
        assert_eq!(value["from"], 1);
        assert_eq!(value["to"], 2);
    }
}
