//! Lease engine: conflicts, expiry, reclamation, attempt caps, and the
//! priority+FIFO selector.

mod common;

use chrono::Duration;
use common::{echo_result, unique_key, TestHarness};
use serde_json::json;
use work_orders_core::allocator::ProposeRequest;
use work_orders_core::lease::LEASE_EXPIRED_MAX_ATTEMPTS;
use work_orders_core::model::{EventKind, ItemState, OrderState};
use work_orders_core::{Caller, CheckoutFilters, Config, MaintenanceFlags, WorkError};

fn short_ttl_config() -> Config {
    let mut config = Config::default();
    config.lease_ttl_seconds = 120;
    config
}

#[tokio::test]
async fn concurrent_checkout_admits_exactly_one_agent() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");

    let proposed = harness.propose_echo("hi", 0, &requester).await.unwrap();
    let a1 = Caller::agent("a1");
    let a2 = Caller::agent("a2");

    let (first, second) = tokio::join!(
        harness.service.checkout_order(proposed.order.id, &a1),
        harness.service.checkout_order(proposed.order.id, &a2),
    );

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one checkout must win");

    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(
        loser.unwrap_err(),
        WorkError::NoItemsAvailable | WorkError::LeaseConflict { .. }
    ));
}

#[tokio::test]
async fn live_lease_blocks_other_agents() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let a1 = Caller::agent("a1");
    let a2 = Caller::agent("a2");

    let proposed = harness.propose_echo("hi", 0, &requester).await.unwrap();
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &a1)
        .await
        .unwrap();

    // Nothing left to check out, and the holder is exclusive.
    assert!(matches!(
        harness
            .service
            .checkout_order(proposed.order.id, &a2)
            .await
            .unwrap_err(),
        WorkError::NoItemsAvailable
    ));
    assert!(matches!(
        harness
            .service
            .heartbeat(checkout.item.id, &a2)
            .await
            .unwrap_err(),
        WorkError::LeaseConflict { .. }
    ));
    assert!(matches!(
        harness
            .service
            .submit(
                checkout.item.id,
                echo_result("hi"),
                None,
                None,
                &a2,
                Some(&unique_key()),
            )
            .await
            .unwrap_err(),
        WorkError::LeaseConflict { .. }
    ));
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_requeued() {
    let harness = TestHarness::with_config(short_ttl_config()).await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_echo("hi", 0, &requester).await.unwrap();
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();

    // Wall clock passes the TTL without a heartbeat.
    harness.clock.advance(Duration::seconds(121));
    let report = harness
        .service
        .maintain(MaintenanceFlags::default())
        .await
        .unwrap();
    assert_eq!(report.reclaimed.requeued, 1);
    assert_eq!(report.reclaimed.failed, 0);

    let detail = harness.service.get(proposed.order.id).await.unwrap();
    let item = &detail.items[0];
    assert_eq!(item.state, ItemState::Queued);
    assert_eq!(item.attempts, 1);
    assert!(item.leased_by_agent_id.is_none());
    assert!(item.lease_expires_at.is_none());
    assert!(item.last_heartbeat_at.is_none());

    let events = harness
        .service
        .logs(None, Some(checkout.item.id), Some(50))
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event == EventKind::LeaseExpired));

    // An expired lease also rejects late operations by the old holder.
    let expired_submit = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();
    harness.clock.advance(Duration::seconds(121));
    assert!(matches!(
        harness
            .service
            .heartbeat(expired_submit.item.id, &agent)
            .await
            .unwrap_err(),
        WorkError::LeaseExpired { .. }
    ));
}

#[tokio::test]
async fn attempt_cap_fails_item_then_dead_letters_it() {
    let mut config = short_ttl_config();
    config.default_max_attempts = 2;
    let harness = TestHarness::with_config(config).await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_echo("hi", 0, &requester).await.unwrap();

    // Two reclamations burn the two attempts.
    for expected_attempts in [1, 2] {
        harness
            .service
            .checkout_order(proposed.order.id, &agent)
            .await
            .unwrap();
        harness.clock.advance(Duration::seconds(121));
        let report = harness
            .service
            .maintain(MaintenanceFlags::default())
            .await
            .unwrap();
        assert_eq!(report.reclaimed.requeued, 1);

        let detail = harness.service.get(proposed.order.id).await.unwrap();
        assert_eq!(detail.items[0].attempts, expected_attempts);
        assert_eq!(detail.items[0].state, ItemState::Queued);
    }

    // The third expiry sees the cap reached and fails the item.
    harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();
    harness.clock.advance(Duration::seconds(121));
    let report = harness
        .service
        .maintain(MaintenanceFlags::default())
        .await
        .unwrap();
    assert_eq!(report.reclaimed.failed, 1);

    let detail = harness.service.get(proposed.order.id).await.unwrap();
    let item = &detail.items[0];
    assert_eq!(item.state, ItemState::Failed);
    assert_eq!(item.attempts, 2);
    assert_eq!(item.error.as_ref().unwrap()["code"], LEASE_EXPIRED_MAX_ATTEMPTS);
    assert!(item.leased_by_agent_id.is_none());

    // Past the dead-letter threshold the next sweep promotes it.
    harness.clock.advance(Duration::hours(49));
    let report = harness
        .service
        .maintain(MaintenanceFlags::default())
        .await
        .unwrap();
    assert_eq!(report.dead_lettered_items, 1);

    let detail = harness.service.get(proposed.order.id).await.unwrap();
    assert_eq!(detail.items[0].state, ItemState::DeadLettered);
}

#[tokio::test]
async fn release_returns_item_and_order_to_the_pool() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_echo("hi", 0, &requester).await.unwrap();
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();

    let released = harness
        .service
        .release(checkout.item.id, &agent)
        .await
        .unwrap();
    assert_eq!(released.state, ItemState::Queued);
    assert!(released.leased_by_agent_id.is_none());
    assert_eq!(released.attempts, 0);

    let detail = harness.service.get(proposed.order.id).await.unwrap();
    assert_eq!(detail.order.state, OrderState::Queued);

    // Another agent cannot release what it does not hold.
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();
    assert!(matches!(
        harness
            .service
            .release(checkout.item.id, &Caller::agent("a2"))
            .await
            .unwrap_err(),
        WorkError::LeaseConflict { .. }
    ));
}

#[tokio::test]
async fn selector_orders_by_priority_then_fifo() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");
    let tenant = unique_key();

    let mut order_ids = Vec::new();
    for (message, priority) in [("first-high", 5), ("second-high", 5), ("low", 1)] {
        let request = ProposeRequest::new("echo", json!({"message": message}))
            .with_priority(priority)
            .with_meta(json!({"tenant_id": tenant}));
        let response = harness
            .service
            .propose(request, &requester, Some(&unique_key()))
            .await
            .unwrap();
        order_ids.push(response.order.id);
        // Distinct creation timestamps make FIFO observable.
        harness.clock.advance(Duration::seconds(1));
    }

    let filters = CheckoutFilters {
        tenant_id: Some(tenant.clone()),
        ..Default::default()
    };

    // Priority 5 orders drain in creation order, then the priority 1 order.
    for expected in [order_ids[0], order_ids[1], order_ids[2]] {
        let checkout = harness.service.checkout(&filters, &agent).await.unwrap();
        assert_eq!(checkout.item.order_id, expected);
    }
    assert!(matches!(
        harness.service.checkout(&filters, &agent).await.unwrap_err(),
        WorkError::NoItemsAvailable
    ));
}

#[tokio::test]
async fn min_priority_filter_skips_low_priority_orders() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");
    let tenant = unique_key();

    let low = ProposeRequest::new("echo", json!({"message": "low"}))
        .with_priority(1)
        .with_meta(json!({"tenant_id": tenant}));
    harness
        .service
        .propose(low, &requester, Some(&unique_key()))
        .await
        .unwrap();

    let filters = CheckoutFilters {
        tenant_id: Some(tenant.clone()),
        min_priority: Some(3),
        ..Default::default()
    };
    assert!(matches!(
        harness.service.checkout(&filters, &agent).await.unwrap_err(),
        WorkError::NoItemsAvailable
    ));
}
