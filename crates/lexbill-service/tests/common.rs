//! Common test utilities for lexbill integration tests.
//!
//! PayOS and the AI provider are stood in for by `wiremock` servers, so the
//! real `PayOsClient` and `OpenAiClient` run against them.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, HeaderValue};
use axum_test::{TestRequest, TestServer};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lexbill_core::UserId;
use lexbill_service::auth::JwtClaims;
use lexbill_service::config::{AiConfig, PayOsConfig};
use lexbill_service::{create_router, crypto, AppState, BillingConfig, ServiceConfig};
use lexbill_store::Store;
use tempfile::TempDir;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const ADMIN_KEY: &str = "test-admin-key";
pub const CHECKSUM_KEY: &str = "test-checksum-key";
pub const AI_ANSWER: &str = "Theo Bộ luật Dân sự, hợp đồng có hiệu lực khi được giao kết hợp pháp.";

/// A router wired to mock PayOS and AI servers.
pub struct TestHarness {
    pub server: TestServer,
    pub payos: MockServer,
    pub ai: MockServer,
    pub test_user_id: UserId,
    /// Database directory when running against RocksDB (kept alive for the test).
    pub _temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// Harness with both integrations configured and answering successfully.
    pub async fn new() -> Self {
        let harness = Self::build(true).await;
        harness.mount_payos_defaults().await;
        harness.mount_ai_answer(AI_ANSWER).await;
        harness
    }

    /// Harness with neither PayOS nor an AI provider configured.
    pub async fn without_integrations() -> Self {
        Self::build(false).await
    }

    async fn build(integrations: bool) -> Self {
        let payos = MockServer::start().await;
        let ai = MockServer::start().await;

        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            data_dir: "unused".into(),
            jwt_secret: JWT_SECRET.into(),
            admin_api_key: Some(ADMIN_KEY.into()),
            payos: integrations.then(|| PayOsConfig {
                client_id: "test-client".into(),
                api_key: "test-api-key".into(),
                checksum_key: CHECKSUM_KEY.into(),
                base_url: payos.uri(),
            }),
            ai: integrations.then(|| AiConfig {
                base_url: format!("{}/v1", ai.uri()),
                api_key: "sk-test".into(),
                model: "test-model".into(),
            }),
            billing: BillingConfig {
                gateway_backoff_base: Duration::from_millis(1),
                webhook_lookup_delay: Duration::from_millis(1),
                charge_backoff: Duration::from_millis(1),
                ai_timeout: Duration::from_secs(5),
                ..BillingConfig::default()
            },
            ..ServiceConfig::default()
        };

        let (store, temp_dir) = open_store();
        let state = AppState::new(store, config);
        let server = TestServer::new(create_router(state)).expect("Failed to create test server");

        Self {
            server,
            payos,
            ai,
            test_user_id: UserId::generate(),
            _temp_dir: temp_dir,
        }
    }

    /// PayOS answers link creation, lookups (PENDING) and cancels.
    pub async fn mount_payos_defaults(&self) {
        Mock::given(method("POST"))
            .and(path("/v2/payment-requests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "00",
                "desc": "success",
                "data": {
                    "checkoutUrl": "https://pay.payos.vn/web/test-link",
                    "qrCode": "00020101021238570010A000000727",
                    "paymentLinkId": "test-link"
                }
            })))
            .mount(&self.payos)
            .await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/v2/payment-requests/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "00",
                "desc": "success",
                "data": { "orderCode": 0, "amount": 0, "amountPaid": 0, "status": "PENDING" }
            })))
            .mount(&self.payos)
            .await;

        Mock::given(method("POST"))
            .and(path_regex(r"^/v2/payment-requests/\d+/cancel$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "00",
                "desc": "success",
                "data": {}
            })))
            .mount(&self.payos)
            .await;
    }

    /// The AI provider answers every completion with `answer`.
    pub async fn mount_ai_answer(&self, answer: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": answer } }]
            })))
            .mount(&self.ai)
            .await;
    }

    /// Replace the AI provider with one that fails every request.
    pub async fn fail_ai(&self) {
        self.ai.reset().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream overloaded"))
            .mount(&self.ai)
            .await;
    }

    /// Completions the AI mock has received.
    pub async fn ai_calls(&self) -> usize {
        self.ai
            .received_requests()
            .await
            .map_or(0, |requests| requests.len())
    }

    /// Attach the test user's bearer token.
    pub fn as_user(&self, request: TestRequest) -> TestRequest {
        as_user(request, &self.test_user_id)
    }

    /// Attach the admin key.
    pub fn as_admin(&self, request: TestRequest) -> TestRequest {
        request.add_header(
            HeaderName::from_static("x-admin-key"),
            HeaderValue::from_static(ADMIN_KEY),
        )
    }

    /// Set the test user's balances through the admin endpoint.
    pub async fn fund(&self, chat: i64, quiz: i64) {
        let balance = self.balance().await;
        let chat_delta = chat - balance["chat_credits"].as_i64().unwrap();
        let quiz_delta = quiz - balance["quiz_gen_credits"].as_i64().unwrap();
        if chat_delta == 0 && quiz_delta == 0 {
            return;
        }
        self.as_admin(self.server.post("/v1/admin/credits/adjust"))
            .json(&json!({
                "user_id": self.test_user_id.to_string(),
                "chat_delta": chat_delta,
                "quiz_delta": quiz_delta,
                "reason": "Test funding"
            }))
            .await
            .assert_status_ok();
    }

    /// The test user's balance body.
    pub async fn balance(&self) -> Value {
        let response = self.as_user(self.server.get("/v1/credits/balance")).await;
        response.assert_status_ok();
        response.json()
    }

    /// Create a payment for `plan_code` and return the response body.
    pub async fn create_payment(&self, plan_code: &str) -> Value {
        let response = self
            .as_user(self.server.post("/v1/payments"))
            .json(&json!({ "plan_code": plan_code }))
            .await;
        response.assert_status(axum::http::StatusCode::CREATED);
        response.json()
    }
}

/// A fresh store: RocksDB in a temporary directory when the backend is built in.
#[cfg(feature = "rocksdb-backend")]
fn open_store() -> (Arc<dyn Store>, Option<TempDir>) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = lexbill_store::RocksStore::open(temp_dir.path()).expect("Failed to open store");
    (Arc::new(store), Some(temp_dir))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store() -> (Arc<dyn Store>, Option<TempDir>) {
    (Arc::new(lexbill_store::MemoryStore::new()), None)
}

/// Mint an HS256 token for `user_id`.
pub fn token_for(user_id: &UserId, secret: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        sub: user_id.to_string(),
        aud: None,
        exp: now + 3600,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("Failed to sign token")
}

/// Attach a bearer token for `user_id`.
pub fn as_user(request: TestRequest, user_id: &UserId) -> TestRequest {
    let value = HeaderValue::from_str(&format!("Bearer {}", token_for(user_id, JWT_SECRET)))
        .expect("Invalid header value");
    request.add_header(AUTHORIZATION, value)
}

/// A PayOS webhook body signed with `checksum_key`.
pub fn signed_webhook(order_code: i64, amount: u64, code: &str, checksum_key: &str) -> Value {
    let desc = if code == "00" { "success" } else { "failed" };
    let data = json!({
        "orderCode": order_code,
        "amount": amount,
        "description": format!("Don hang {order_code}"),
        "accountNumber": "12345678",
        "reference": format!("FT{order_code}"),
        "transactionDateTime": "2026-10-19 10:00:00",
        "currency": "VND",
        "paymentLinkId": "test-link",
        "code": code,
        "desc": desc,
        "counterAccountBankId": null,
        "counterAccountName": null,
        "virtualAccountName": null
    });
    let Value::Object(fields) = &data else {
        unreachable!("webhook data is an object");
    };
    let signature = crypto::sign_fields(checksum_key, fields).expect("Failed to sign webhook");

    json!({
        "code": "00",
        "desc": "success",
        "success": code == "00",
        "data": data,
        "signature": signature
    })
}
