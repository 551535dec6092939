//! Payments and the settlement state machine.
//!
//! ```text
//! PENDING ──► PAID ──► CREDITED
//!    │          └────► PAID_CREDIT_FAILED ──► CREDITED
//!    │                        └─────────────► NEEDS_REVIEW
//!    ├──► FAILED | EXPIRED | CANCELLED ──(verified success webhook)──► PAID
//!    └──► NEEDS_REVIEW ──(verified success webhook)──► PAID
//! ```
//!
//! Once money is confirmed received a payment never becomes FAILED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BillingError, Result};
use crate::{OrderCode, PaymentId, UserId};

/// Gateway result code meaning the transfer succeeded.
pub const GATEWAY_SUCCESS_CODE: &str = "00";

/// Payment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Checkout link issued, awaiting transfer.
    Pending,
    /// Money received, credits not yet granted.
    Paid,
    /// Money received and credits granted.
    Credited,
    /// Money received, credit grant failed; retried by the credit-retry job.
    PaidCreditFailed,
    /// Gateway rejected or the link could not be created.
    Failed,
    /// Link expired without payment.
    Expired,
    /// Cancelled by the user.
    Cancelled,
    /// Needs an operator (amount mismatch, paid without webhook, retries exhausted).
    NeedsReview,
}

impl PaymentStatus {
    /// All statuses, for iteration in stores and tests.
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Paid,
        Self::Credited,
        Self::PaidCreditFailed,
        Self::Failed,
        Self::Expired,
        Self::Cancelled,
        Self::NeedsReview,
    ];

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Credited => "CREDITED",
            Self::PaidCreditFailed => "PAID_CREDIT_FAILED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
            Self::NeedsReview => "NEEDS_REVIEW",
        }
    }

    /// Money has been received for this payment.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Paid | Self::Credited | Self::PaidCreditFailed)
    }

    /// Ended without money received; the idempotency key may be recycled.
    #[must_use]
    pub const fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Expired | Self::Cancelled)
    }

    /// Whether `self → to` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use PaymentStatus::{
            Cancelled, Credited, Expired, Failed, NeedsReview, Paid, PaidCreditFailed, Pending,
        };
        matches!(
            (self, to),
            (Pending, Paid | Failed | Expired | Cancelled | NeedsReview)
                | (Paid, Credited | PaidCreditFailed)
                | (PaidCreditFailed, Credited | NeedsReview)
                | (Failed | Expired | Cancelled | NeedsReview, Paid)
                | (Failed | Expired | Cancelled, NeedsReview)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment attempt for one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Internal identifier.
    pub id: PaymentId,
    /// Buyer.
    pub user_id: UserId,
    /// Plan being purchased.
    pub plan_code: String,
    /// Amount in VND.
    pub amount: u64,
    /// Gateway-visible order code.
    pub order_code: OrderCode,
    /// Current status.
    pub status: PaymentStatus,
    /// Set once by the first webhook delivery that claims this payment.
    pub webhook_claimed: bool,
    /// Cached checkout link.
    pub checkout_url: Option<String>,
    /// Cached QR payload.
    pub qr_code: Option<String>,
    /// Gateway transaction reference, set when paid.
    pub gateway_transaction_id: Option<String>,
    /// Failed credit attempts so far.
    pub credit_retry_count: u32,
    /// Last failure reason.
    pub failure_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// When money was received.
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Create a new PENDING payment.
    #[must_use]
    pub fn new(
        user_id: UserId,
        plan_code: impl Into<String>,
        amount: u64,
        order_code: OrderCode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::generate(),
            user_id,
            plan_code: plan_code.into(),
            amount,
            order_code,
            status: PaymentStatus::Pending,
            webhook_claimed: false,
            checkout_url: None,
            qr_code: None,
            gateway_transaction_id: None,
            credit_retry_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        }
    }

    /// Move to `to`, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// `InvalidPaymentTransition` if `to` is not reachable from the current status.
    pub fn transition(&mut self, to: PaymentStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(BillingError::InvalidPaymentTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Same as [`Payment::transition`] but records a failure reason.
    ///
    /// # Errors
    ///
    /// `InvalidPaymentTransition` if `to` is not reachable from the current status.
    pub fn fail_with(
        &mut self,
        to: PaymentStatus,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(to, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}
