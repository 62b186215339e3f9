//! Maintainer: periodic housekeeping driven by a timer, never by callers.
//!
//! Three independently toggleable sweeps: reclaim expired leases,
//! dead-letter long-failed orders and items, and flag stale orders. Each
//! mutation runs in its own transaction, so concurrent maintainers on other
//! hosts are safe, just redundant.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use crate::error::Result;
use crate::kernel::WorkKernel;
use crate::lease::{LeaseEngine, ReclaimOutcome};
use crate::machine::{StateMachine, TransitionOpts};
use crate::metrics::Counter;
use crate::model::states::{Actor, ItemState, OrderState};
use crate::model::{WorkItem, WorkOrder};

/// Which sweeps a maintenance tick runs. Defaults to all three.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceFlags {
    pub reclaim_leases: bool,
    pub dead_letter: bool,
    pub check_stale: bool,
}

impl Default for MaintenanceFlags {
    fn default() -> Self {
        Self {
            reclaim_leases: true,
            dead_letter: true,
            check_stale: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub reclaimed: ReclaimOutcome,
    pub dead_lettered_orders: u64,
    pub dead_lettered_items: u64,
    pub stale_orders: Vec<Uuid>,
}

pub struct Maintainer {
    kernel: Arc<WorkKernel>,
    machine: Arc<StateMachine>,
    lease: Arc<LeaseEngine>,
}

impl Maintainer {
    pub fn new(
        kernel: Arc<WorkKernel>,
        machine: Arc<StateMachine>,
        lease: Arc<LeaseEngine>,
    ) -> Self {
        Self {
            kernel,
            machine,
            lease,
        }
    }

    /// Run one maintenance tick.
    pub async fn run(&self, flags: MaintenanceFlags) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        if flags.reclaim_leases {
            report.reclaimed = self.lease.reclaim_expired().await?;
        }
        if flags.dead_letter {
            let (orders, items) = self.dead_letter_sweep().await?;
            report.dead_lettered_orders = orders;
            report.dead_lettered_items = items;
        }
        if flags.check_stale {
            report.stale_orders = self.stale_scan().await?;
        }

        tracing::info!(
            reclaimed = report.reclaimed.touched(),
            dead_lettered_orders = report.dead_lettered_orders,
            dead_lettered_items = report.dead_lettered_items,
            stale = report.stale_orders.len(),
            "maintenance tick complete"
        );

        Ok(report)
    }

    /// Promote orders and items failed longer than the threshold to
    /// `dead_lettered`. Never resurrects anything.
    async fn dead_letter_sweep(&self) -> Result<(u64, u64)> {
        let cutoff = self.kernel.now() - Duration::hours(self.kernel.config.dead_letter_after_hours);
        let actor = Actor::system("maintainer");

        let mut dead_orders = 0;
        let orders = {
            let mut conn = self.kernel.db.acquire().await?;
            WorkOrder::find_failed_before(cutoff, 500, &mut *conn).await?
        };
        for order in orders {
            match self.dead_letter_order(order.id, &actor).await {
                Ok(true) => dead_orders += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(order_id = %order.id, error = %error, "dead-letter failed");
                }
            }
        }

        let mut dead_items = 0;
        let items = {
            let mut conn = self.kernel.db.acquire().await?;
            WorkItem::find_failed_before(cutoff, 500, &mut *conn).await?
        };
        for item in items {
            match self.dead_letter_item(item.id, &actor).await {
                Ok(true) => dead_items += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(item_id = %item.id, error = %error, "dead-letter failed");
                }
            }
        }

        self.kernel
            .metrics
            .increment_by(Counter::DeadLettered, dead_orders + dead_items);

        Ok((dead_orders, dead_items))
    }

    async fn dead_letter_order(&self, order_id: Uuid, actor: &Actor) -> Result<bool> {
        let now = self.kernel.now();

        let mut tx = self.kernel.db.begin().await?;
        let mut order = WorkOrder::find_for_update(order_id, &mut *tx).await?;
        if order.state != OrderState::Failed {
            return Ok(false);
        }

        let event = self
            .machine
            .transition_order(
                &mut *tx,
                &mut order,
                OrderState::DeadLettered,
                actor,
                now,
                TransitionOpts::payload(json!({"reason": "failed past dead-letter threshold"})),
            )
            .await?;
        tx.commit().await?;
        self.kernel.bus.emit(event);

        Ok(true)
    }

    async fn dead_letter_item(&self, item_id: Uuid, actor: &Actor) -> Result<bool> {
        let now = self.kernel.now();

        let mut tx = self.kernel.db.begin().await?;
        let mut item = WorkItem::find_for_update(item_id, &mut *tx).await?;
        if item.state != ItemState::Failed {
            return Ok(false);
        }

        let event = self
            .machine
            .transition_item(
                &mut *tx,
                &mut item,
                ItemState::DeadLettered,
                actor,
                now,
                TransitionOpts::payload(json!({"reason": "failed past dead-letter threshold"})),
            )
            .await?;
        tx.commit().await?;
        self.kernel.bus.emit(event);

        Ok(true)
    }

    /// Identify orders stuck outside terminal states past the threshold.
    /// Only logs; never mutates.
    async fn stale_scan(&self) -> Result<Vec<Uuid>> {
        let cutoff =
            self.kernel.now() - Duration::hours(self.kernel.config.stale_order_threshold_hours);

        let mut conn = self.kernel.db.acquire().await?;
        let ids = WorkOrder::find_stale_ids(cutoff, 500, &mut *conn).await?;

        if !ids.is_empty() {
            if self.kernel.config.enable_alerts {
                tracing::warn!(
                    count = ids.len(),
                    order_ids = ?ids,
                    threshold_hours = self.kernel.config.stale_order_threshold_hours,
                    "stale orders detected"
                );
            } else {
                tracing::info!(
                    count = ids.len(),
                    order_ids = ?ids,
                    threshold_hours = self.kernel.config.stale_order_threshold_hours,
                    "stale orders detected"
                );
            }
        }

        Ok(ids)
    }
}
