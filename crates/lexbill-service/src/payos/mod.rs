//! Payment gateway integration.
//!
//! [`PaymentGateway`] is the seam the settlement engine talks to; [`PayOsClient`]
//! is the production implementation.

mod client;
mod types;

pub use client::PayOsClient;
pub use types::{
    CheckoutLink, CreatePaymentLink, Envelope, GatewayPaymentInfo, GatewayPaymentStatus,
    WebhookData, WebhookPayload,
};

use async_trait::async_trait;

use serde_json::Value;

use lexbill_core::{BillingError, OrderCode};

use crate::crypto;

/// Gateway failures, split by whether a retry can help.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network failure, timeout, 5xx or rate limit.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Rejected request, bad credentials or malformed response.
    #[error("gateway rejected request: {0}")]
    Terminal(String),

    /// The gateway does not know this order.
    #[error("order not found at gateway")]
    NotFound,

    /// Webhook signature mismatch.
    #[error("invalid webhook signature")]
    InvalidSignature,
}

impl GatewayError {
    /// Whether the call may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) => Self::GatewayTransient(msg),
            GatewayError::Terminal(msg) => Self::GatewayTerminal(msg),
            GatewayError::NotFound => Self::GatewayTerminal("order not found at gateway".into()),
            GatewayError::InvalidSignature => Self::WebhookSignatureInvalid,
        }
    }
}

/// Outbound payment gateway operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout link.
    async fn create_payment_link(
        &self,
        request: &CreatePaymentLink,
    ) -> Result<CheckoutLink, GatewayError>;

    /// Look up the current status of an order.
    async fn get_payment_status(
        &self,
        order_code: OrderCode,
    ) -> Result<GatewayPaymentInfo, GatewayError>;

    /// Cancel an open checkout link.
    async fn cancel_payment_link(
        &self,
        order_code: OrderCode,
        reason: &str,
    ) -> Result<(), GatewayError>;

    /// Verify a webhook signature and decode its data.
    fn verify_webhook(&self, payload: &WebhookPayload) -> Result<WebhookData, GatewayError>;
}

/// Check a webhook's signature against `checksum_key` and decode its data.
pub fn verify_signed_payload(
    checksum_key: &str,
    payload: &WebhookPayload,
) -> Result<WebhookData, GatewayError> {
    let Value::Object(fields) = &payload.data else {
        return Err(GatewayError::InvalidSignature);
    };
    if !crypto::verify_fields(checksum_key, fields, &payload.signature) {
        return Err(GatewayError::InvalidSignature);
    }
    serde_json::from_value(payload.data.clone())
        .map_err(|e| GatewayError::Terminal(format!("malformed webhook data: {e}")))
}
