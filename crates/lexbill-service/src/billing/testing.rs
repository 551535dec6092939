//! In-process fakes for the gateway and AI provider.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use lexbill_core::OrderCode;

use crate::ai::{AiError, AiProvider, CompletionRequest};
use crate::crypto;
use crate::payos::{
    verify_signed_payload, CheckoutLink, CreatePaymentLink, GatewayError, GatewayPaymentInfo,
    GatewayPaymentStatus, PaymentGateway, WebhookData, WebhookPayload,
};

pub(crate) const CHECKSUM_KEY: &str = "test-checksum";

/// Scripted answer to a status lookup.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Lookup {
    Status(GatewayPaymentStatus),
    NotFound,
    Down,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum CreateFailure {
    Transient,
    Terminal,
}

#[derive(Default)]
pub(crate) struct FakeGateway {
    create_failures: Mutex<VecDeque<CreateFailure>>,
    lookups: Mutex<HashMap<i64, Lookup>>,
    pub create_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn fail_next_create(&self, failure: CreateFailure) {
        self.create_failures.lock().push_back(failure);
    }

    pub fn set_lookup(&self, order_code: OrderCode, lookup: Lookup) {
        self.lookups.lock().insert(order_code.value(), lookup);
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment_link(
        &self,
        request: &CreatePaymentLink,
    ) -> Result<CheckoutLink, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let failure = self.create_failures.lock().pop_front();
        match failure {
            Some(CreateFailure::Transient) => Err(GatewayError::Transient("HTTP 503".into())),
            Some(CreateFailure::Terminal) => Err(GatewayError::Terminal("231: duplicate".into())),
            None => Ok(CheckoutLink {
                checkout_url: format!("https://pay.example/{}", request.order_code),
                qr_code: Some(format!("qr-{}", request.order_code)),
                payment_link_id: None,
            }),
        }
    }

    async fn get_payment_status(
        &self,
        order_code: OrderCode,
    ) -> Result<GatewayPaymentInfo, GatewayError> {
        let lookup = self
            .lookups
            .lock()
            .get(&order_code.value())
            .copied()
            .unwrap_or(Lookup::Status(GatewayPaymentStatus::Pending));
        match lookup {
            Lookup::Status(status) => Ok(GatewayPaymentInfo {
                order_code: order_code.value(),
                amount: 0,
                amount_paid: 0,
                status,
            }),
            Lookup::NotFound => Err(GatewayError::NotFound),
            Lookup::Down => Err(GatewayError::Transient("connection refused".into())),
        }
    }

    async fn cancel_payment_link(&self, _: OrderCode, _: &str) -> Result<(), GatewayError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn verify_webhook(&self, payload: &WebhookPayload) -> Result<WebhookData, GatewayError> {
        verify_signed_payload(CHECKSUM_KEY, payload)
    }
}

/// A webhook body signed with [`CHECKSUM_KEY`].
pub(crate) fn signed_webhook(order_code: OrderCode, amount: u64, code: &str) -> WebhookPayload {
    let data = json!({
        "orderCode": order_code.value(),
        "amount": amount,
        "description": format!("Don hang {order_code}"),
        "reference": format!("FT{order_code}"),
        "code": code,
        "desc": if code == "00" { "success" } else { "failed" },
        "paymentLinkId": "link",
    });
    let Value::Object(fields) = &data else {
        unreachable!("json! object literal")
    };
    let signature = crypto::sign_fields(CHECKSUM_KEY, fields).unwrap();
    WebhookPayload {
        code: code.into(),
        desc: "success".into(),
        success: code == "00",
        data,
        signature,
    }
}

/// Scripted AI provider; answers "answer N" once the script runs out.
#[derive(Default)]
pub(crate) struct FakeAi {
    script: Mutex<VecDeque<Result<String, String>>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub last_request: Mutex<Option<CompletionRequest>>,
}

impl FakeAi {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, message: &str) {
        self.script.lock().push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiProvider for FakeAi {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_request.lock() = Some(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(answer)) => Ok(answer),
            Some(Err(body)) => Err(AiError::Api { status: 500, body }),
            None => Ok(format!("answer {n}")),
        }
    }
}
