//! Append-only credit ledger entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::balance::CreditType;
use crate::{TransactionId, UserId};

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Credits granted by a paid order.
    Purchase,
    /// Direct deduction.
    Usage,
    /// Free grant (welcome bonus, promotions).
    Bonus,
    /// Money-back credit.
    Refund,
    /// Administrative increase.
    AdminAdd,
    /// Administrative decrease.
    AdminRemove,
    /// Credit held for a unit of work.
    Reserve,
    /// Held credit consumed.
    Confirm,
    /// Held credit returned.
    Release,
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Time-ordered identifier.
    pub id: TransactionId,

    /// Owner.
    pub user_id: UserId,

    /// Kind of entry.
    pub transaction_type: TransactionType,

    /// Which balance moved.
    pub credit_type: CreditType,

    /// Signed amount applied to the balance (negative for debits, 0 for CONFIRM).
    pub amount: i64,

    /// Balance after this entry was applied.
    pub balance_after: u64,

    /// Human-readable description.
    pub description: String,

    /// Reservation id or order code this entry belongs to.
    pub reference: Option<String>,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Build a new entry stamped with `now`.
    #[must_use]
    pub fn new(
        user_id: UserId,
        transaction_type: TransactionType,
        credit_type: CreditType,
        amount: i64,
        balance_after: u64,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            transaction_type,
            credit_type,
            amount,
            balance_after,
            description: description.into(),
            reference: None,
            created_at: now,
        }
    }

    /// Attach a reference.
    #[must_use]
    pub fn with_reference(mut self, reference: impl ToString) -> Self {
        self.reference = Some(reference.to_string());
        self
    }
}

/// Convert an unsigned credit amount into a signed ledger delta.
///
/// Saturates at `i64::MAX`; credit counts never approach it.
#[must_use]
pub fn signed(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}
