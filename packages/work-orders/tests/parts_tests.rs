//! Partial submissions: validation, latest-part selection, and finalize.

mod common;

use common::{unique_key, TestHarness};
use serde_json::json;
use work_orders_core::model::{ItemState, OrderState, PartStatus};
use work_orders_core::{Caller, FinalizeMode, WorkError};

#[tokio::test]
async fn strict_finalize_assembles_required_parts() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_report(&requester).await.unwrap();
    assert_eq!(
        proposed.items[0].parts_required,
        Some(vec!["research".to_string(), "analysis".to_string()])
    );

    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();
    let item_id = checkout.item.id;

    let research = harness
        .service
        .submit_part(
            item_id,
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
    assert_eq!(research.part.status, PartStatus::Validated);
    assert_eq!(research.parts_state["research"]["status"], "validated");

    let analysis = harness
        .service
        .submit_part(
            item_id,
            "analysis",
            Some(1),
            json!({"content": "conclusions"}),
            None,
            None,
            &agent,
            Some(&unique_key()),
        )
        .await
        .unwrap();
    assert_eq!(analysis.parts_state["analysis"]["seq"], 1);

    let finalized = harness
        .service
        .finalize(item_id, FinalizeMode::Strict, &agent, Some(&unique_key()))
        .await
        .unwrap();
    assert_eq!(finalized.item.state, ItemState::Submitted);
    assert_eq!(finalized.order_state, OrderState::Submitted);

    let assembled = finalized.item.assembled_result.as_ref().unwrap();
    assert_eq!(assembled["research"]["content"], "findings");
    assert_eq!(assembled["analysis"]["content"], "conclusions");
    assert_eq!(finalized.item.result.as_ref().unwrap(), assembled);
}

#[tokio::test]
async fn strict_finalize_lists_missing_parts() {
    let harness = TestHarness::new().await.unwrap();
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

    let error = harness
        .service
        .finalize(
            checkout.item.id,
            FinalizeMode::Strict,
            &agent,
            Some(&unique_key()),
        )
        .await
        .unwrap_err();
    let WorkError::ValidationFailed { errors } = error else {
        panic!("expected ValidationFailed");
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field, "analysis");
    assert_eq!(errors[0].code, "missing_part");

    // The failed finalize left the in-flight item untouched.
    let detail = harness.service.get(proposed.order.id).await.unwrap();
    assert_eq!(detail.items[0].state, ItemState::InProgress);
    assert!(detail.items[0].assembled_result.is_none());
}

#[tokio::test]
async fn latest_part_wins_by_seq_then_id() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_report(&requester).await.unwrap();
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();
    let item_id = checkout.item.id;

    for (seq, content) in [(1, "draft"), (2, "revised")] {
        harness
            .service
            .submit_part(
                item_id,
                "research",
                Some(seq),
                json!({"content": content}),
                None,
                None,
                &agent,
                Some(&unique_key()),
            )
            .await
            .unwrap();
    }
    // Two submissions without a seq: NULL is distinct, both rows persist,
    // and the later insert wins the tiebreak.
    for content in ["unseq-a", "unseq-b"] {
        harness
            .service
            .submit_part(
                item_id,
                "analysis",
                None,
                json!({"content": content}),
                None,
                None,
                &agent,
                Some(&unique_key()),
            )
            .await
            .unwrap();
    }

    let parts = harness.service.list_parts(item_id, None, None).await.unwrap();
    assert_eq!(parts.parts.len(), 4);

    let finalized = harness
        .service
        .finalize(item_id, FinalizeMode::Strict, &agent, Some(&unique_key()))
        .await
        .unwrap();
    let assembled = finalized.item.assembled_result.as_ref().unwrap();
    assert_eq!(assembled["research"]["content"], "revised");
    assert_eq!(assembled["analysis"]["content"], "unseq-b");
}

#[tokio::test]
async fn invalid_part_is_stored_rejected_and_raised() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_report(&requester).await.unwrap();
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();
    let item_id = checkout.item.id;

    let error = harness
        .service
        .submit_part(
            item_id,
            "research",
            Some(1),
            json!({"notes": "no content field"}),
            None,
            None,
            &agent,
            Some(&unique_key()),
        )
        .await
        .unwrap_err();
    let WorkError::ValidationFailed { errors } = error else {
        panic!("expected ValidationFailed");
    };
    assert_eq!(errors[0].field, "content");

    // The rejected part is on record with its errors.
    let parts = harness
        .service
        .list_parts(item_id, Some("research"), None)
        .await
        .unwrap();
    assert_eq!(parts.parts.len(), 1);
    assert_eq!(parts.parts[0].status, PartStatus::Rejected);
    assert!(parts.parts[0].errors.is_some());
    assert_eq!(
        parts.parts_state.as_ref().unwrap()["research"]["status"],
        "rejected"
    );

    // Strict finalize refuses while the only latest part is rejected.
    assert!(matches!(
        harness
            .service
            .finalize(item_id, FinalizeMode::Strict, &agent, Some(&unique_key()))
            .await
            .unwrap_err(),
        WorkError::ValidationFailed { .. }
    ));
}

#[tokio::test]
async fn best_effort_finalize_takes_what_validated() {
    let harness = TestHarness::new().await.unwrap();
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

    let finalized = harness
        .service
        .finalize(
            checkout.item.id,
            FinalizeMode::BestEffort,
            &agent,
            Some(&unique_key()),
        )
        .await
        .unwrap();
    let assembled = finalized.item.assembled_result.as_ref().unwrap();
    assert_eq!(assembled["research"]["content"], "findings");
    assert!(assembled.get("analysis").is_none());
    assert_eq!(finalized.item.state, ItemState::Submitted);
}

#[tokio::test]
async fn part_checksum_matches_canonical_payload() {
    let harness = TestHarness::new().await.unwrap();
    let requester = Caller::user("u1");
    let agent = Caller::agent("a1");

    let proposed = harness.propose_report(&requester).await.unwrap();
    let checkout = harness
        .service
        .checkout_order(proposed.order.id, &agent)
        .await
        .unwrap();

    let payload = json!({"content": "findings", "score": 3});
    let response = harness
        .service
        .submit_part(
            checkout.item.id,
            "research",
            Some(1),
            payload.clone(),
            None,
            None,
            &agent,
            Some(&unique_key()),
        )
        .await
        .unwrap();

    assert_eq!(
        response.part.checksum,
        work_orders_core::common::hash::payload_checksum(&payload)
    );
}
