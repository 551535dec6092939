//! Idempotency records for payment creation.
//!
//! A record is keyed by `"{user_id}:{client_key}"` so that two users can never
//! collide on the same client-chosen key.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::payment::PaymentStatus;
use crate::{PaymentId, UserId};

/// Mirrored state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    /// Attempt in progress, no payment attached yet.
    Pending,
    /// A payment is attached; carries its status at attach time.
    Attached(PaymentStatus),
}

/// One live record per (user, client key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIdempotencyRecord {
    /// `"{user_id}:{client_key}"`.
    pub scoped_key: String,
    /// Owner.
    pub user_id: UserId,
    /// Plan requested with this key.
    pub plan_code: String,
    /// Attached payment, if the attempt got that far.
    pub payment_id: Option<PaymentId>,
    /// Mirrored status.
    pub status: IdempotencyStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Deletion deadline.
    pub expires_at: DateTime<Utc>,
}

impl PaymentIdempotencyRecord {
    /// Build the scoped key for a user and client key.
    #[must_use]
    pub fn scoped_key(user_id: &UserId, client_key: &str) -> String {
        format!("{user_id}:{client_key}")
    }

    /// Create a fresh PENDING record.
    #[must_use]
    pub fn new(
        user_id: UserId,
        client_key: &str,
        plan_code: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            scoped_key: Self::scoped_key(&user_id, client_key),
            user_id,
            plan_code: plan_code.into(),
            payment_id: None,
            status: IdempotencyStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether the record has passed its TTL.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Link a payment and mirror its status.
    pub fn attach(&mut self, payment_id: PaymentId, status: PaymentStatus) {
        self.payment_id = Some(payment_id);
        self.status = IdempotencyStatus::Attached(status);
    }

    /// Detach the payment so the key can be reused.
    pub fn reset(&mut self) {
        self.payment_id = None;
        self.status = IdempotencyStatus::Pending;
    }
}
