//! Health check handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Whether PayOS checkout is available.
    pub payments: bool,
    /// Whether an AI provider is available.
    pub ai: bool,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "lexbill".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        payments: state.has_payments(),
        ai: state.has_ai(),
    })
}
