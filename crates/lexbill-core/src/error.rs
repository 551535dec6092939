//! Error types for lexbill.

use crate::balance::CreditType;
use crate::ids::IdError;
use crate::payment::PaymentStatus;

/// Result type for lexbill operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in billing operations.
///
/// Variants map onto the HTTP surface as 402 (insufficient), 403 (expired or
/// forbidden), 404, 409 (conflicts), 502 (gateway or AI) and 500 (logic or storage).
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Balance too low for the requested deduction.
    #[error("insufficient {credit_type} credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Which balance was checked.
        credit_type: CreditType,
        /// Current balance.
        balance: u64,
        /// Required amount.
        required: u64,
    },

    /// Credits exist but have passed their expiry.
    #[error("credits expired")]
    ExpiredCredits,

    /// A reservation was confirmed or released from a non-ACTIVE state.
    #[error("reservation {reservation_id} is {state}, expected ACTIVE")]
    InvalidReservationState {
        /// The reservation that was touched.
        reservation_id: String,
        /// Its current state.
        state: String,
    },

    /// A payment status change outside the settlement state machine.
    #[error("invalid payment transition from {from} to {to}")]
    InvalidPaymentTransition {
        /// Current status.
        from: PaymentStatus,
        /// Requested status.
        to: PaymentStatus,
    },

    /// A retryable gateway failure (network, 5xx, rate limit).
    #[error("payment gateway unavailable: {0}")]
    GatewayTransient(String),

    /// A non-retryable gateway failure (rejected request, bad credentials).
    #[error("payment gateway rejected request: {0}")]
    GatewayTerminal(String),

    /// The webhook signature did not verify.
    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    /// Money was received but credits could not be granted.
    #[error("credit grant failed for paid order {order_code}: {reason}")]
    CreditGrantFailureAfterPayment {
        /// The paid order.
        order_code: i64,
        /// Underlying failure.
        reason: String,
    },

    /// An optimistic update lost the race too many times.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The work unit is already being charged by another request.
    #[error("a charge is already in progress for this session")]
    ChargeInProgress,

    /// The per-session question ceiling has been reached.
    #[error("question limit reached: {limit}")]
    QuestionLimitReached {
        /// The configured ceiling.
        limit: u32,
    },

    /// A recent payment for the same plan is still open and could not be verified.
    #[error("a pending payment already exists: {order_code}")]
    PendingPaymentExists {
        /// The open order.
        order_code: i64,
    },

    /// An adjustment would drive a balance below zero.
    #[error("adjustment would make {credit_type} balance negative: balance={balance}, delta={delta}")]
    NegativeBalance {
        /// Which balance was adjusted.
        credit_type: CreditType,
        /// Current balance.
        balance: u64,
        /// Requested delta.
        delta: i64,
    },

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity.
        entity: &'static str,
        /// Its identifier.
        id: String,
    },

    /// The caller does not own the entity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The AI provider failed or timed out.
    #[error("AI provider failed: {0}")]
    AiProviderFailed(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid amount or argument.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl BillingError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a retry of the same call could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::GatewayTransient(_) | Self::Storage(_) | Self::ConcurrentModification(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = BillingError::InsufficientCredits {
            credit_type: CreditType::Chat,
            balance: 0,
            required: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient CHAT credits: balance=0, required=1"
        );

        let err = BillingError::not_found("payment", 100_001);
        assert_eq!(err.to_string(), "payment not found: 100001");
    }

    #[test]
    fn transient_classification() {
        assert!(BillingError::GatewayTransient("timeout".into()).is_transient());
        assert!(!BillingError::GatewayTerminal("bad key".into()).is_transient());
        assert!(!BillingError::ExpiredCredits.is_transient());
    }
}
