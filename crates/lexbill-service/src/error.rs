//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use lexbill_core::BillingError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - concurrent change or invalid state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Insufficient credits.
    #[error("insufficient {credit_type} credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Which balance.
        credit_type: String,
        /// Current balance.
        balance: u64,
        /// Required amount.
        required: u64,
    },

    /// Credits have expired.
    #[error("credits expired")]
    CreditsExpired,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// A required integration is not configured.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits {
                credit_type,
                balance,
                required,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "credit_type": credit_type,
                    "balance": balance,
                    "required": required
                })),
            ),
            Self::CreditsExpired => (
                StatusCode::FORBIDDEN,
                "credits_expired",
                self.to_string(),
                None,
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
                None,
            ),
            Self::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits {
                credit_type,
                balance,
                required,
            } => Self::InsufficientCredits {
                credit_type: credit_type.to_string(),
                balance,
                required,
            },
            BillingError::ExpiredCredits => Self::CreditsExpired,
            BillingError::Forbidden(msg) => Self::Forbidden(msg),
            e @ BillingError::NotFound { .. } => Self::NotFound(e.to_string()),
            e @ (BillingError::ConcurrentModification(_)
            | BillingError::ChargeInProgress
            | BillingError::QuestionLimitReached { .. }
            | BillingError::PendingPaymentExists { .. }
            | BillingError::InvalidPaymentTransition { .. }) => Self::Conflict(e.to_string()),
            e @ (BillingError::NegativeBalance { .. }
            | BillingError::InvalidAmount(_)
            | BillingError::InvalidId(_)
            | BillingError::WebhookSignatureInvalid) => Self::BadRequest(e.to_string()),
            e @ (BillingError::GatewayTransient(_)
            | BillingError::GatewayTerminal(_)
            | BillingError::AiProviderFailed(_)) => Self::ExternalService(e.to_string()),
            e @ BillingError::InvalidReservationState { .. } => {
                tracing::error!(error = %e, "Reservation state violation");
                Self::Internal(e.to_string())
            }
            e @ (BillingError::CreditGrantFailureAfterPayment { .. }
            | BillingError::Storage(_)
            | BillingError::Configuration(_)) => Self::Internal(e.to_string()),
        }
    }
}

impl From<lexbill_store::StoreError> for ApiError {
    fn from(err: lexbill_store::StoreError) -> Self {
        BillingError::from(err).into()
    }
}
