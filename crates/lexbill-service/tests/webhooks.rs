//! PayOS webhook integration tests.

mod common;

use common::{signed_webhook, TestHarness, CHECKSUM_KEY};
use serde_json::Value;

async fn post_webhook(harness: &TestHarness, body: &Value) -> Value {
    let response = harness.server.post("/webhooks/payos").json(body).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["received"], true);
    body
}

async fn payment_status(harness: &TestHarness, order_code: i64) -> Value {
    harness
        .as_user(harness.server.get(&format!("/v1/payments/{order_code}")))
        .await
        .json()
}

#[tokio::test]
async fn success_webhook_credits_the_plan_once() {
    let harness = TestHarness::new().await;
    harness.balance().await;
    let created = harness.create_payment("REGULAR").await;
    let order_code = created["order_code"].as_i64().unwrap();

    let webhook = signed_webhook(order_code, 159_000, "00", CHECKSUM_KEY);
    let first = post_webhook(&harness, &webhook).await;
    assert_eq!(first["outcome"], "credited");

    let payment = payment_status(&harness, order_code).await;
    assert_eq!(payment["status"], "CREDITED");
    assert!(payment["paid_at"].is_string());

    let balance = harness.balance().await;
    assert_eq!(balance["chat_credits"], 110);
    assert_eq!(balance["plan"], "REGULAR");
    assert!(balance["expires_at"].is_string());

    // Redelivery is acknowledged but grants nothing.
    let second = post_webhook(&harness, &webhook).await;
    assert_eq!(second["outcome"], "duplicate");
    assert_eq!(harness.balance().await["chat_credits"], 110);

    let history: Value = harness
        .as_user(harness.server.get("/v1/credits/transactions"))
        .await
        .json();
    let purchases = history["transactions"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["transaction_type"] == "PURCHASE")
        .count();
    assert_eq!(purchases, 1);
}

#[tokio::test]
async fn student_plan_grants_both_balances() {
    let harness = TestHarness::new().await;
    let created = harness.create_payment("STUDENT").await;
    let order_code = created["order_code"].as_i64().unwrap();

    post_webhook(
        &harness,
        &signed_webhook(order_code, 249_000, "00", CHECKSUM_KEY),
    )
    .await;

    let balance = harness.balance().await;
    assert_eq!(balance["chat_credits"], 110);
    assert_eq!(balance["quiz_gen_credits"], 20);
    assert_eq!(balance["plan"], "STUDENT");
}

#[tokio::test]
async fn bad_signature_is_dropped() {
    let harness = TestHarness::new().await;
    let created = harness.create_payment("REGULAR").await;
    let order_code = created["order_code"].as_i64().unwrap();

    let forged = signed_webhook(order_code, 159_000, "00", "wrong-key");
    let body = post_webhook(&harness, &forged).await;
    assert_eq!(body["outcome"], "rejected");

    assert_eq!(payment_status(&harness, order_code).await["status"], "PENDING");
    assert_eq!(harness.balance().await["chat_credits"], 10);
}

#[tokio::test]
async fn failure_webhook_marks_payment_failed() {
    let harness = TestHarness::new().await;
    let created = harness.create_payment("REGULAR").await;
    let order_code = created["order_code"].as_i64().unwrap();

    let body = post_webhook(
        &harness,
        &signed_webhook(order_code, 159_000, "01", CHECKSUM_KEY),
    )
    .await;
    assert_eq!(body["outcome"], "marked_failed");
    assert_eq!(payment_status(&harness, order_code).await["status"], "FAILED");
}

#[tokio::test]
async fn money_received_after_cancel_is_still_credited() {
    let harness = TestHarness::new().await;
    let created = harness.create_payment("REGULAR").await;
    let order_code = created["order_code"].as_i64().unwrap();

    harness
        .as_user(harness.server.post(&format!("/v1/payments/{order_code}/cancel")))
        .await
        .assert_status_ok();

    let body = post_webhook(
        &harness,
        &signed_webhook(order_code, 159_000, "00", CHECKSUM_KEY),
    )
    .await;
    assert_eq!(body["outcome"], "credited");
    assert_eq!(payment_status(&harness, order_code).await["status"], "CREDITED");
    assert_eq!(harness.balance().await["chat_credits"], 110);
}

#[tokio::test]
async fn amount_mismatch_parks_payment_for_review() {
    let harness = TestHarness::new().await;
    let created = harness.create_payment("REGULAR").await;
    let order_code = created["order_code"].as_i64().unwrap();

    let body = post_webhook(
        &harness,
        &signed_webhook(order_code, 1_000, "00", CHECKSUM_KEY),
    )
    .await;
    assert_eq!(body["outcome"], "amount_mismatch");
    assert_eq!(payment_status(&harness, order_code).await["status"], "NEEDS_REVIEW");
    assert_eq!(harness.balance().await["chat_credits"], 10);
}

#[tokio::test]
async fn unknown_order_and_malformed_bodies_are_acknowledged() {
    let harness = TestHarness::new().await;

    let body = post_webhook(
        &harness,
        &signed_webhook(424_242, 159_000, "00", CHECKSUM_KEY),
    )
    .await;
    assert_eq!(body["outcome"], "unknown_order");

    let response = harness
        .server
        .post("/webhooks/payos")
        .text("not json")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body.get("outcome").is_none());
}

#[tokio::test]
async fn parallel_redeliveries_grant_one_purchase() {
    let harness = TestHarness::new().await;
    harness.balance().await;
    let created = harness.create_payment("REGULAR").await;
    let order_code = created["order_code"].as_i64().unwrap();
    let webhook = signed_webhook(order_code, 159_000, "00", CHECKSUM_KEY);

    let deliveries = tokio::join!(
        post_webhook(&harness, &webhook),
        post_webhook(&harness, &webhook),
        post_webhook(&harness, &webhook),
        post_webhook(&harness, &webhook),
        post_webhook(&harness, &webhook),
        post_webhook(&harness, &webhook),
    );
    let outcomes = [
        deliveries.0,
        deliveries.1,
        deliveries.2,
        deliveries.3,
        deliveries.4,
        deliveries.5,
    ];
    let credited = outcomes.iter().filter(|b| b["outcome"] == "credited").count();
    assert_eq!(credited, 1);
    assert!(outcomes
        .iter()
        .all(|b| b["outcome"] == "credited" || b["outcome"] == "duplicate"));

    let history: Value = harness
        .as_user(harness.server.get("/v1/credits/transactions"))
        .await
        .json();
    let purchases = history["transactions"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["transaction_type"] == "PURCHASE")
        .count();
    assert_eq!(purchases, 1);
    assert_eq!(harness.balance().await["chat_credits"], 110);
}
