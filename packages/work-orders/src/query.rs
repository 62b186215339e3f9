//! Read-only query surface: filtered, sorted, paginated orders and events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnection, Postgres};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::common::pagination::{Page, PageParams};
use crate::error::Result;
use crate::kernel::WorkKernel;
use crate::model::states::{ActorKind, ItemState, OrderState};
use crate::model::{WorkEvent, WorkOrder};

/// Comparison operator applied to a sortable column.
#[derive(Debug, Clone, Copy)]
pub enum Cmp<T> {
    Gt(T),
    Gte(T),
    Lt(T),
    Lte(T),
}

impl<T> Cmp<T> {
    fn operator(&self) -> &'static str {
        match self {
            Cmp::Gt(_) => ">",
            Cmp::Gte(_) => ">=",
            Cmp::Lt(_) => "<",
            Cmp::Lte(_) => "<=",
        }
    }

    fn value(&self) -> &T {
        match self {
            Cmp::Gt(v) | Cmp::Gte(v) | Cmp::Lt(v) | Cmp::Lte(v) => v,
        }
    }
}

/// Filters accepted by `list_orders`. All are optional and combine with AND.
#[derive(Debug, Default, Clone)]
pub struct OrderFilter {
    pub id: Option<Uuid>,
    pub state: Option<OrderState>,
    pub order_type: Option<String>,
    pub requested_by_kind: Option<ActorKind>,
    pub requested_by_id: Option<String>,
    /// Matches orders having at least one item in this state.
    pub item_state: Option<ItemState>,
    pub priority: Option<Cmp<i32>>,
    pub created_at: Option<Cmp<DateTime<Utc>>>,
    pub last_transitioned_at: Option<Cmp<DateTime<Utc>>>,
    pub applied_at: Option<Cmp<DateTime<Utc>>>,
    pub completed_at: Option<Cmp<DateTime<Utc>>>,
    /// JSONB containment on `meta`.
    pub meta_contains: Option<Value>,
    /// Virtual filter: the order has a queued item with no live lease.
    pub has_available_items: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Priority,
    CreatedAt,
    LastTransitionedAt,
    AppliedAt,
    CompletedAt,
    /// Synthesized count of the order's items.
    ItemsCount,
}

impl SortField {
    fn sql(&self) -> &'static str {
        match self {
            SortField::Priority => "o.priority",
            SortField::CreatedAt => "o.created_at",
            SortField::LastTransitionedAt => "o.last_transitioned_at",
            SortField::AppliedAt => "o.applied_at",
            SortField::CompletedAt => "o.completed_at",
            SortField::ItemsCount => "(SELECT COUNT(*) FROM work_items i WHERE i.order_id = o.id)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    fn sql(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrderSort {
    pub field: SortField,
    pub dir: SortDir,
}

impl OrderSort {
    pub fn new(field: SortField, dir: SortDir) -> Self {
        Self { field, dir }
    }
}

pub struct QuerySurface {
    kernel: Arc<WorkKernel>,
}

impl QuerySurface {
    pub fn new(kernel: Arc<WorkKernel>) -> Self {
        Self { kernel }
    }

    /// List orders under the given filter, sort, and page.
    ///
    /// Default sort is priority DESC then created_at ASC; an explicit sort
    /// still gets created_at ASC as the tiebreak.
    pub async fn list_orders(
        &self,
        conn: &mut PgConnection,
        filter: &OrderFilter,
        sort: Option<OrderSort>,
        page: Option<PageParams>,
    ) -> Result<Page<WorkOrder>> {
        let params = page
            .unwrap_or(PageParams {
                page: 1,
                per_page: self.kernel.config.default_page_size,
            })
            .clamped(self.kernel.config.max_page_size);
        let now = self.kernel.now();

        let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM work_orders o WHERE 1=1");
        push_filters(&mut count_query, filter, now);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await?;

        let mut query = QueryBuilder::new(
            "SELECT o.id, o.order_type, o.state, o.priority, o.payload, o.meta, \
             o.requested_by_kind, o.requested_by_id, o.created_at, \
             o.last_transitioned_at, o.applied_at, o.completed_at \
             FROM work_orders o WHERE 1=1",
        );
        push_filters(&mut query, filter, now);

        query.push(" ORDER BY ");
        match sort {
            Some(sort) => {
                query.push(sort.field.sql());
                query.push(" ");
                query.push(sort.dir.sql());
                if sort.field != SortField::CreatedAt {
                    query.push(", o.created_at ASC");
                }
            }
            None => {
                query.push("o.priority DESC, o.created_at ASC");
            }
        }

        query.push(" LIMIT ");
        query.push_bind(params.limit());
        query.push(" OFFSET ");
        query.push_bind(params.offset());

        let orders = query
            .build_query_as::<WorkOrder>()
            .fetch_all(&mut *conn)
            .await?;

        Ok(Page::new(orders, params, total))
    }

    /// Recent events for an order.
    pub async fn order_events(
        &self,
        conn: &mut PgConnection,
        order_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<WorkEvent>> {
        let limit = limit
            .unwrap_or(self.kernel.config.default_page_size)
            .clamp(1, self.kernel.config.max_page_size);
        WorkEvent::find_for_order(order_id, limit, conn).await
    }

    /// Recent events for an item.
    pub async fn item_events(
        &self,
        conn: &mut PgConnection,
        item_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<WorkEvent>> {
        let limit = limit
            .unwrap_or(self.kernel.config.default_page_size)
            .clamp(1, self.kernel.config.max_page_size);
        WorkEvent::find_for_item(item_id, limit, conn).await
    }
}

fn push_filters(
    query: &mut QueryBuilder<'_, Postgres>,
    filter: &OrderFilter,
    now: DateTime<Utc>,
) {
    if let Some(id) = filter.id {
        query.push(" AND o.id = ").push_bind(id);
    }
    if let Some(state) = filter.state {
        query.push(" AND o.state = ").push_bind(state);
    }
    if let Some(order_type) = &filter.order_type {
        query.push(" AND o.order_type = ").push_bind(order_type.clone());
    }
    if let Some(kind) = filter.requested_by_kind {
        query.push(" AND o.requested_by_kind = ").push_bind(kind);
    }
    if let Some(requested_by) = &filter.requested_by_id {
        query
            .push(" AND o.requested_by_id = ")
            .push_bind(requested_by.clone());
    }
    if let Some(item_state) = filter.item_state {
        query
            .push(" AND EXISTS (SELECT 1 FROM work_items i WHERE i.order_id = o.id AND i.state = ")
            .push_bind(item_state);
        query.push(")");
    }
    if let Some(cmp) = &filter.priority {
        query.push(" AND o.priority ");
        query.push(cmp.operator());
        query.push(" ");
        query.push_bind(*cmp.value());
    }
    push_time_cmp(query, "o.created_at", &filter.created_at);
    push_time_cmp(query, "o.last_transitioned_at", &filter.last_transitioned_at);
    push_time_cmp(query, "o.applied_at", &filter.applied_at);
    push_time_cmp(query, "o.completed_at", &filter.completed_at);
    if let Some(contains) = &filter.meta_contains {
        query.push(" AND o.meta @> ").push_bind(contains.clone());
    }
    if let Some(wanted) = filter.has_available_items {
        if wanted {
            query.push(" AND EXISTS ");
        } else {
            query.push(" AND NOT EXISTS ");
        }
        query.push(
            "(SELECT 1 FROM work_items i WHERE i.order_id = o.id AND i.state = 'queued' \
             AND (i.lease_expires_at IS NULL OR i.lease_expires_at <= ",
        );
        query.push_bind(now);
        query.push("))");
    }
}

fn push_time_cmp(
    query: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    cmp: &Option<Cmp<DateTime<Utc>>>,
) {
    if let Some(cmp) = cmp {
        query.push(" AND ");
        query.push(column);
        query.push(" ");
        query.push(cmp.operator());
        query.push(" ");
        query.push_bind(*cmp.value());
    }
}
