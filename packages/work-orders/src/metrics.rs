//! In-process counters for the control plane.
//!
//! Transport is someone else's problem; the core records named counters and
//! exposes a snapshot. Disabled metrics are a no-op.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter names recorded by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    OrdersProposed,
    ItemsPlanned,
    ItemsCheckedOut,
    Heartbeats,
    ItemsSubmitted,
    PartsSubmitted,
    ItemsFinalized,
    OrdersApproved,
    OrdersApplied,
    OrdersCompleted,
    OrdersRejected,
    OrdersFailed,
    LeasesReclaimed,
    DeadLettered,
}

impl Counter {
    fn index(&self) -> usize {
        match self {
            Counter::OrdersProposed => 0,
            Counter::ItemsPlanned => 1,
            Counter::ItemsCheckedOut => 2,
            Counter::Heartbeats => 3,
            Counter::ItemsSubmitted => 4,
            Counter::PartsSubmitted => 5,
            Counter::ItemsFinalized => 6,
            Counter::OrdersApproved => 7,
            Counter::OrdersApplied => 8,
            Counter::OrdersCompleted => 9,
            Counter::OrdersRejected => 10,
            Counter::OrdersFailed => 11,
            Counter::LeasesReclaimed => 12,
            Counter::DeadLettered => 13,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Counter::OrdersProposed => "orders_proposed",
            Counter::ItemsPlanned => "items_planned",
            Counter::ItemsCheckedOut => "items_checked_out",
            Counter::Heartbeats => "heartbeats",
            Counter::ItemsSubmitted => "items_submitted",
            Counter::PartsSubmitted => "parts_submitted",
            Counter::ItemsFinalized => "items_finalized",
            Counter::OrdersApproved => "orders_approved",
            Counter::OrdersApplied => "orders_applied",
            Counter::OrdersCompleted => "orders_completed",
            Counter::OrdersRejected => "orders_rejected",
            Counter::OrdersFailed => "orders_failed",
            Counter::LeasesReclaimed => "leases_reclaimed",
            Counter::DeadLettered => "dead_lettered",
        }
    }
}

const ALL_COUNTERS: [Counter; 14] = [
    Counter::OrdersProposed,
    Counter::ItemsPlanned,
    Counter::ItemsCheckedOut,
    Counter::Heartbeats,
    Counter::ItemsSubmitted,
    Counter::PartsSubmitted,
    Counter::ItemsFinalized,
    Counter::OrdersApproved,
    Counter::OrdersApplied,
    Counter::OrdersCompleted,
    Counter::OrdersRejected,
    Counter::OrdersFailed,
    Counter::LeasesReclaimed,
    Counter::DeadLettered,
];

#[derive(Debug)]
pub struct Metrics {
    enabled: bool,
    namespace: String,
    counters: [AtomicU64; 14],
}

impl Metrics {
    pub fn new(enabled: bool, namespace: impl Into<String>) -> Self {
        Self {
            enabled,
            namespace: namespace.into(),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, "")
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn increment(&self, counter: Counter) {
        self.increment_by(counter, 1);
    }

    pub fn increment_by(&self, counter: Counter, by: u64) {
        if !self.enabled || by == 0 {
            return;
        }
        self.counters[counter.index()].fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Namespaced snapshot of every counter.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        ALL_COUNTERS
            .iter()
            .map(|c| {
                (
                    format!("{}.{}", self.namespace, c.name()),
                    self.get(*c),
                )
            })
            .collect()
    }
}
