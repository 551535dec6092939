//! Plan catalogue and PayOS checkout handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use lexbill_core::{OrderCode, Payment, PaymentStatus, Plan};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the client's retry key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Plan response.
#[derive(Debug, Serialize)]
pub struct PlanResponse {
    /// Plan code.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Price in VND.
    pub price: u64,
    /// Chat credits granted.
    pub chat_credits: u64,
    /// Quiz-generation credits granted.
    pub quiz_gen_credits: u64,
    /// Validity in months.
    pub duration_months: u32,
    /// Whether the plan can be bought.
    pub purchasable: bool,
}

impl From<&Plan> for PlanResponse {
    fn from(plan: &Plan) -> Self {
        Self {
            code: plan.code.clone(),
            name: plan.name.clone(),
            price: plan.price,
            chat_credits: plan.chat_credits,
            quiz_gen_credits: plan.quiz_gen_credits,
            duration_months: plan.duration_months,
            purchasable: plan.is_purchasable(),
        }
    }
}

/// List the plan catalogue.
pub async fn list_plans(State(state): State<Arc<AppState>>) -> Json<Vec<PlanResponse>> {
    Json(state.config.plans.plans().iter().map(PlanResponse::from).collect())
}

/// Payment response.
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    /// Gateway order code.
    pub order_code: i64,
    /// Plan bought.
    pub plan_code: String,
    /// Amount in VND.
    pub amount: u64,
    /// Current status.
    pub status: PaymentStatus,
    /// Hosted checkout page.
    pub checkout_url: Option<String>,
    /// QR payload for bank apps.
    pub qr_code: Option<String>,
    /// Last failure reason.
    pub failure_reason: Option<String>,
    /// Created timestamp.
    pub created_at: String,
    /// When money was received.
    pub paid_at: Option<String>,
}

impl From<&Payment> for PaymentResponse {
    fn from(payment: &Payment) -> Self {
        Self {
            order_code: payment.order_code.value(),
            plan_code: payment.plan_code.clone(),
            amount: payment.amount,
            status: payment.status,
            checkout_url: payment.checkout_url.clone(),
            qr_code: payment.qr_code.clone(),
            failure_reason: payment.failure_reason.clone(),
            created_at: payment.created_at.to_rfc3339(),
            paid_at: payment.paid_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Create payment request.
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    /// Plan to buy.
    pub plan_code: String,
}

/// Create payment response.
#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    /// The payment to complete.
    #[serde(flatten)]
    pub payment: PaymentResponse,
    /// Whether an earlier payment was returned.
    pub reused: bool,
}

/// Start a plan purchase.
///
/// Clients should send an `Idempotency-Key` header so that retries return the
/// same checkout instead of opening a second order.
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(body): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), ApiError> {
    let client_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let result = state
        .settlement()?
        .create_payment(&auth.user_id, &body.plan_code, client_key)
        .await?;

    let status = if result.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(CreatePaymentResponse {
            payment: PaymentResponse::from(&result.payment),
            reused: result.reused,
        }),
    ))
}

/// List payments response.
#[derive(Debug, Serialize)]
pub struct ListPaymentsResponse {
    /// Payments (newest first).
    pub payments: Vec<PaymentResponse>,
}

/// List the caller's recent payments.
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<ListPaymentsResponse>, ApiError> {
    let payments = state.settlement()?.list_payments(&auth.user_id)?;
    Ok(Json(ListPaymentsResponse {
        payments: payments.iter().map(PaymentResponse::from).collect(),
    }))
}

fn parse_order_code(raw: i64) -> Result<OrderCode, ApiError> {
    OrderCode::new(raw).map_err(|_| ApiError::BadRequest("Invalid order code".into()))
}

/// Get one of the caller's payments.
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(order_code): Path<i64>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state
        .settlement()?
        .get_payment(&auth.user_id, parse_order_code(order_code)?)?;
    Ok(Json(PaymentResponse::from(&payment)))
}

/// Cancel one of the caller's pending payments.
pub async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(order_code): Path<i64>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state
        .settlement()?
        .cancel_payment(&auth.user_id, parse_order_code(order_code)?)
        .await?;
    Ok(Json(PaymentResponse::from(&payment)))
}
