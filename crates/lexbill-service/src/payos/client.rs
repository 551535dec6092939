//! PayOS API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use lexbill_core::{OrderCode, GATEWAY_SUCCESS_CODE};

use super::types::{
    CancelBody, CheckoutLink, CreatePaymentLink, CreatePaymentLinkBody, Envelope,
    GatewayPaymentInfo, WebhookData, WebhookPayload,
};
use super::{GatewayError, PaymentGateway};
use crate::config::PayOsConfig;
use crate::crypto;

/// PayOS rejects descriptions longer than this.
const MAX_DESCRIPTION_CHARS: usize = 25;

/// Envelope code PayOS uses for an unknown order.
const ORDER_NOT_FOUND_CODE: &str = "101";

/// PayOS merchant API client.
#[derive(Debug, Clone)]
pub struct PayOsClient {
    client: Client,
    base_url: String,
    client_id: String,
    api_key: String,
    checksum_key: String,
}

impl PayOsClient {
    /// Create a new client.
    pub fn new(config: &PayOsConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Terminal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            api_key: config.api_key.clone(),
            checksum_key: config.checksum_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn create_signature(&self, request: &CreatePaymentLink, description: &str) -> Result<String, GatewayError> {
        let Value::Object(fields) = json!({
            "amount": request.amount,
            "cancelUrl": request.cancel_url,
            "description": description,
            "orderCode": request.order_code,
            "returnUrl": request.return_url,
        }) else {
            return Err(GatewayError::Terminal("signature fields are not an object".into()));
        };
        crypto::sign_fields(&self.checksum_key, &fields)
            .ok_or_else(|| GatewayError::Terminal("invalid checksum key".into()))
    }

    /// Decode an envelope, classifying HTTP and envelope failures.
    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transient(format!("HTTP {status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Terminal(format!("HTTP {status}: {body}")));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::Terminal(format!("malformed response: {e}")))?;

        if envelope.code == ORDER_NOT_FOUND_CODE {
            return Err(GatewayError::NotFound);
        }
        if envelope.code != GATEWAY_SUCCESS_CODE {
            return Err(GatewayError::Terminal(format!(
                "{}: {}",
                envelope.code, envelope.desc
            )));
        }
        envelope
            .data
            .ok_or_else(|| GatewayError::Terminal("response has no data".into()))
    }
}

fn transport_error(e: &reqwest::Error) -> GatewayError {
    GatewayError::Transient(e.to_string())
}

#[async_trait]
impl PaymentGateway for PayOsClient {
    async fn create_payment_link(
        &self,
        request: &CreatePaymentLink,
    ) -> Result<CheckoutLink, GatewayError> {
        let description: String = request.description.chars().take(MAX_DESCRIPTION_CHARS).collect();
        let body = CreatePaymentLinkBody {
            order_code: request.order_code,
            amount: request.amount,
            description: &description,
            return_url: &request.return_url,
            cancel_url: &request.cancel_url,
            signature: self.create_signature(request, &description)?,
        };

        tracing::debug!(order_code = request.order_code, amount = request.amount, "Creating PayOS payment link");

        let response = self
            .client
            .post(self.url("/v2/payment-requests"))
            .header("x-client-id", &self.client_id)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        Self::handle_response(response).await
    }

    async fn get_payment_status(
        &self,
        order_code: OrderCode,
    ) -> Result<GatewayPaymentInfo, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v2/payment-requests/{order_code}")))
            .header("x-client-id", &self.client_id)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        Self::handle_response(response).await
    }

    async fn cancel_payment_link(
        &self,
        order_code: OrderCode,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.url(&format!("/v2/payment-requests/{order_code}/cancel")))
            .header("x-client-id", &self.client_id)
            .header("x-api-key", &self.api_key)
            .json(&CancelBody {
                cancellation_reason: reason,
            })
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        Self::handle_response::<Value>(response).await.map(|_| ())
    }

    fn verify_webhook(&self, payload: &WebhookPayload) -> Result<WebhookData, GatewayError> {
        super::verify_signed_payload(&self.checksum_key, payload)
    }
}
