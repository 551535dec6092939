//! PayOS webhook handler.
//!
//! PayOS retries any non-2xx delivery, so this endpoint always answers 200 once
//! the body has been read. Signature failures, unknown orders and processing
//! errors are logged and dropped; the reconcile job covers missed deliveries.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::billing::WebhookOutcome;
use crate::payos::WebhookPayload;
use crate::state::AppState;

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was received.
    pub received: bool,
    /// What the delivery did, when it could be processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WebhookOutcome>,
}

/// Handle PayOS payment webhooks.
pub async fn payos_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Json<WebhookResponse> {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "Malformed PayOS webhook body");
            return Json(WebhookResponse {
                received: true,
                outcome: None,
            });
        }
    };

    let Some(settlement) = state.settlement.as_ref() else {
        tracing::warn!("PayOS webhook received but payments are not configured");
        return Json(WebhookResponse {
            received: true,
            outcome: None,
        });
    };

    tracing::debug!(code = %payload.code, "Received PayOS webhook");
    let outcome = settlement.handle_webhook(&payload).await;

    Json(WebhookResponse {
        received: true,
        outcome: Some(outcome),
    })
}
