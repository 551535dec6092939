//! Admin endpoint integration tests.

mod common;

use axum::http::{HeaderName, HeaderValue};
use common::TestHarness;
use serde_json::{json, Value};

#[tokio::test]
async fn adjust_requires_the_admin_key() {
    let harness = TestHarness::new().await;
    let body = json!({
        "user_id": harness.test_user_id.to_string(),
        "chat_delta": 5,
        "reason": "Goodwill"
    });

    harness
        .server
        .post("/v1/admin/credits/adjust")
        .json(&body)
        .await
        .assert_status_unauthorized();

    harness
        .server
        .post("/v1/admin/credits/adjust")
        .add_header(
            HeaderName::from_static("x-admin-key"),
            HeaderValue::from_static("guess"),
        )
        .json(&body)
        .await
        .assert_status_unauthorized();

    // A user token is not an admin key.
    harness
        .as_user(harness.server.post("/v1/admin/credits/adjust"))
        .json(&body)
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn adjust_moves_both_balances_and_records_actor() {
    let harness = TestHarness::new().await;

    let response = harness
        .as_admin(harness.server.post("/v1/admin/credits/adjust"))
        .add_header(
            HeaderName::from_static("x-admin-id"),
            HeaderValue::from_static("support-7"),
        )
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "chat_delta": -4,
            "quiz_delta": 3,
            "reason": "Plan correction"
        }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["chat_credits"], 6);
    assert_eq!(body["quiz_gen_credits"], 3);

    let history: Value = harness
        .as_user(harness.server.get("/v1/credits/transactions"))
        .await
        .json();
    let adjustments: Vec<&Value> = history["transactions"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["transaction_type"] != "BONUS")
        .collect();
    assert_eq!(adjustments.len(), 2);
    assert!(adjustments.iter().all(|t| t["reference"] == "support-7"));
    assert!(adjustments.iter().any(|t| t["transaction_type"] == "ADMIN_REMOVE" && t["amount"] == -4));
    assert!(adjustments.iter().any(|t| t["transaction_type"] == "ADMIN_ADD" && t["credit_type"] == "QUIZ_GEN"));
}

#[tokio::test]
async fn adjust_rejects_bad_requests() {
    let harness = TestHarness::new().await;
    let user_id = harness.test_user_id.to_string();

    for body in [
        json!({ "user_id": user_id, "chat_delta": -11, "reason": "Too much" }),
        json!({ "user_id": user_id, "reason": "Nothing" }),
        json!({ "user_id": user_id, "chat_delta": 1, "reason": "  " }),
        json!({ "user_id": "nobody", "chat_delta": 1, "reason": "Bad id" }),
    ] {
        harness
            .as_admin(harness.server.post("/v1/admin/credits/adjust"))
            .json(&body)
            .await
            .assert_status_bad_request();
    }

    // The rejected overdraw left the balance untouched.
    assert_eq!(harness.balance().await["chat_credits"], 10);
}

#[tokio::test]
async fn admin_reads_any_balance() {
    let harness = TestHarness::new().await;
    harness.fund(42, 0).await;

    let response = harness
        .as_admin(
            harness
                .server
                .get(&format!("/v1/admin/users/{}/balance", harness.test_user_id)),
        )
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["chat_credits"], 42);
    assert_eq!(body["plan"], "REGULAR");
}

#[tokio::test]
async fn manual_reconcile_reports_counts() {
    let harness = TestHarness::new().await;
    harness.create_payment("REGULAR").await;

    let response = harness
        .as_admin(harness.server.post("/v1/admin/payments/reconcile"))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    // Fresh payments are younger than the reconcile threshold.
    assert_eq!(body["checked"], 0);
    assert_eq!(body["expired"], 0);
    assert_eq!(body["needs_review"], 0);
}
