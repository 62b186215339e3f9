//! Query surface filters, sorting, pagination, and ownership cascade.

mod common;

use common::{echo_result, unique_key, TestHarness};
use serde_json::json;
use work_orders_core::allocator::ProposeRequest;
use work_orders_core::common::pagination::PageParams;
use work_orders_core::model::{ItemState, OrderState};
use work_orders_core::query::{Cmp, OrderFilter, OrderSort, SortDir, SortField};
use test_context::test_context;
use work_orders_core::Caller;

#[test_context(TestHarness)]
#[tokio::test]
async fn filters_narrow_by_state_type_and_priority(harness: &mut TestHarness) {
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let high = harness.propose_echo("high", 8, &requester).await.unwrap();
    harness.propose_echo("low", 2, &requester).await.unwrap();
    harness.propose_report(&requester).await.unwrap();

    // Drive one order to completed so states differ.
    let checkout = harness
        .service
        .checkout_order(high.order.id, &agent)
        .await
        .unwrap();
    harness
        .service
        .submit(
            checkout.item.id,
            echo_result("high"),
            None,
            None,
            &agent,
            Some(&unique_key()),
        )
        .await
        .unwrap();
    harness
        .service
        .approve(high.order.id, &requester, Some(&unique_key()))
        .await
        .unwrap();

    let completed = harness
        .service
        .list(
            &OrderFilter {
                state: Some(OrderState::Completed),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(completed.items.len(), 1);
    assert_eq!(completed.items[0].id, high.order.id);

    let echoes = harness
        .service
        .list(
            &OrderFilter {
                order_type: Some("echo".to_string()),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(echoes.items.len(), 2);

    let high_priority = harness
        .service
        .list(
            &OrderFilter {
                priority: Some(Cmp::Gte(5)),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(high_priority.items.len(), 1);
    assert_eq!(high_priority.items[0].priority, 8);

    let applied_after = harness
        .service
        .list(
            &OrderFilter {
                applied_at: Some(Cmp::Lte(harness.kernel.now())),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(applied_after.items.len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn meta_contains_and_item_state_filters(harness: &mut TestHarness) {
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");
    let tenant = unique_key();

    let tagged = harness
        .service
        .propose(
            ProposeRequest::new("echo", json!({"message": "tagged"}))
                .with_meta(json!({"tenant_id": tenant, "team": "alpha"})),
            &requester,
            Some(&unique_key()),
        )
        .await
        .unwrap();
    harness.propose_echo("untagged", 0, &requester).await.unwrap();

    let by_meta = harness
        .service
        .list(
            &OrderFilter {
                meta_contains: Some(json!({"tenant_id": tenant})),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(by_meta.items.len(), 1);
    assert_eq!(by_meta.items[0].id, tagged.order.id);

    harness
        .service
        .checkout_order(tagged.order.id, &agent)
        .await
        .unwrap();

    let with_leased_items = harness
        .service
        .list(
            &OrderFilter {
                item_state: Some(ItemState::Leased),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(with_leased_items.items.len(), 1);
    assert_eq!(with_leased_items.items[0].id, tagged.order.id);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn has_available_items_tracks_live_leases(harness: &mut TestHarness) {
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_echo("hi", 0, &requester).await.unwrap();

    let available = harness
        .service
        .list(
            &OrderFilter {
                has_available_items: Some(true),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(available.items.len(), 1);

    harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();

    let available = harness
        .service
        .list(
            &OrderFilter {
                has_available_items: Some(true),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert!(available.items.is_empty());

    let unavailable = harness
        .service
        .list(
            &OrderFilter {
                has_available_items: Some(false),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(unavailable.items.len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn default_sort_is_priority_desc_then_fifo(harness: &mut TestHarness) {
    let requester = Caller::user("u1");

    for (message, priority) in [("mid", 3), ("top", 9), ("bottom", 1)] {
        harness.propose_echo(message, priority, &requester).await.unwrap();
        harness.clock.advance(chrono::Duration::seconds(1));
    }

    let listed = harness
        .service
        .list(&OrderFilter::default(), None, None)
        .await
        .unwrap();
    let priorities: Vec<i32> = listed.items.iter().map(|o| o.priority).collect();
    assert_eq!(priorities, vec![9, 3, 1]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn items_count_sort_and_pagination(harness: &mut TestHarness) {
    let requester = Caller::user("u1");

    for message in ["a", "b", "c", "d", "e"] {
        harness.propose_echo(message, 0, &requester).await.unwrap();
        harness.clock.advance(chrono::Duration::seconds(1));
    }

    let page_one = harness
        .service
        .list(
            &OrderFilter::default(),
            Some(OrderSort::new(SortField::CreatedAt, SortDir::Asc)),
            Some(PageParams::new(1, 2)),
        )
        .await
        .unwrap();
    assert_eq!(page_one.items.len(), 2);
    assert_eq!(page_one.total, 5);
    assert!(page_one.has_next_page());

    let page_three = harness
        .service
        .list(
            &OrderFilter::default(),
            Some(OrderSort::new(SortField::CreatedAt, SortDir::Asc)),
            Some(PageParams::new(3, 2)),
        )
        .await
        .unwrap();
    assert_eq!(page_three.items.len(), 1);
    assert!(!page_three.has_next_page());

    // Oversized page sizes clamp to the configured maximum.
    let clamped = harness
        .service
        .list(
            &OrderFilter::default(),
            None,
            Some(PageParams::new(1, 10_000)),
        )
        .await
        .unwrap();
    assert_eq!(clamped.per_page, 100);

    // items_count sorts; every echo order has exactly one item.
    let by_count = harness
        .service
        .list(
            &OrderFilter::default(),
            Some(OrderSort::new(SortField::ItemsCount, SortDir::Desc)),
            None,
        )
        .await
        .unwrap();
    assert_eq!(by_count.items.len(), 5);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn deleting_an_order_cascades_to_everything_it_owns(harness: &mut TestHarness) {
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_report(&requester).await.unwrap();
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();
    harness
        .service
        .submit_part(
            checkout.item.id,
            "research",
            Some(1),
            json!({"content": "findings"}),
            None,
            None,
            &agent,
            Some(&unique_key()),
        )
        .await
        .unwrap();

    let order_id = proposed.order.id;
    let counts = |table: &str| {
        let pool = harness.db_pool.clone();
        let sql = match table {
            "work_items" => "SELECT COUNT(*) FROM work_items WHERE order_id = $1",
            "work_events" => "SELECT COUNT(*) FROM work_events WHERE order_id = $1",
            "work_provenances" => "SELECT COUNT(*) FROM work_provenances WHERE order_id = $1",
            "work_item_parts" => {
                "SELECT COUNT(*) FROM work_item_parts p \
                 JOIN work_items i ON i.id = p.work_item_id WHERE i.order_id = $1"
            }
            _ => unreachable!(),
        };
        async move {
            sqlx::query_scalar::<_, i64>(sql)
                .bind(order_id)
                .fetch_one(&pool)
                .await
                .unwrap()
        }
    };

    assert!(counts("work_items").await > 0);
    assert!(counts("work_events").await > 0);
    assert!(counts("work_provenances").await > 0);
    assert!(counts("work_item_parts").await > 0);

    // External pruning deletes the order row; ownership cascades.
    sqlx::query("DELETE FROM work_orders WHERE id = $1")
        .bind(order_id)
        .execute(&harness.db_pool)
        .await
        .unwrap();

    assert_eq!(counts("work_items").await, 0);
    assert_eq!(counts("work_events").await, 0);
    assert_eq!(counts("work_provenances").await, 0);
    assert_eq!(counts("work_item_parts").await, 0);
}
