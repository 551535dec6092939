//! Admin handlers (`x-admin-key` auth).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use lexbill_core::UserId;

use crate::auth::AdminAuth;
use crate::billing::ReconcileReport;
use crate::error::ApiError;
use crate::handlers::credits::BalanceResponse;
use crate::state::AppState;

/// Admin credit adjustment request.
#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    /// Target user.
    pub user_id: String,
    /// Signed change to the chat balance.
    #[serde(default)]
    pub chat_delta: i64,
    /// Signed change to the quiz-generation balance.
    #[serde(default)]
    pub quiz_delta: i64,
    /// Reason recorded on the transactions and the audit event.
    pub reason: String,
}

fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid user_id: {raw}")))
}

/// Adjust a user's balances.
pub async fn adjust_credits(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Json(body): Json<AdjustCreditsRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id = parse_user_id(&body.user_id)?;
    let reason = body.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::BadRequest("A reason is required".into()));
    }

    let balance = state
        .ledger
        .admin_adjust(&user_id, body.chat_delta, body.quiz_delta, reason, &auth.admin_id)?;

    tracing::info!(
        admin_id = %auth.admin_id,
        user_id = %user_id,
        chat_delta = body.chat_delta,
        quiz_delta = body.quiz_delta,
        "Admin adjusted credits"
    );

    Ok(Json(balance.into()))
}

/// Get any user's balance.
pub async fn get_user_balance(
    State(state): State<Arc<AppState>>,
    _auth: AdminAuth,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let balance = state.ledger.get_balance(&user_id)?;
    Ok(Json(balance.into()))
}

/// Run one reconcile pass now instead of waiting for the job.
pub async fn run_reconcile(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
) -> Result<Json<ReconcileReport>, ApiError> {
    let report = state.settlement()?.reconcile(Utc::now()).await?;
    tracing::info!(admin_id = %auth.admin_id, report = ?report, "Manual reconcile finished");
    Ok(Json(report))
}
