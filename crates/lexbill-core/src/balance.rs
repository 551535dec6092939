//! Per-user credit balances.
//!
//! Each user owns one [`UserCreditBalance`] row holding two independent
//! unsigned counters. The row is only ever mutated under the user's row lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BillingError, Result};
use crate::UserId;

/// Chat credits granted once when a balance is first provisioned.
pub const WELCOME_BONUS_CHAT_CREDITS: u64 = 10;

/// Chat balance above which a user without quiz credits is labelled REGULAR.
const REGULAR_CHAT_THRESHOLD: u64 = 10;

/// Which of the two balances an operation draws on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditType {
    /// One credit per chat session.
    Chat,
    /// One credit per quiz generation.
    QuizGen,
}

impl CreditType {
    /// Stable string form used in logs and storage keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "CHAT",
            Self::QuizGen => "QUIZ_GEN",
        }
    }
}

impl fmt::Display for CreditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived plan label shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanLabel {
    /// Welcome-bonus level only.
    Free,
    /// Purchased chat credits.
    Regular,
    /// Has quiz-generation credits.
    Student,
}

/// A user's credit balance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreditBalance {
    /// Owner.
    pub user_id: UserId,

    /// Remaining chat credits.
    pub chat_credits: u64,

    /// Remaining quiz-generation credits.
    pub quiz_gen_credits: u64,

    /// Shared expiry for both balances. `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When the row was last written.
    pub updated_at: DateTime<Utc>,

    /// Incremented on every write.
    pub version: u64,
}

impl UserCreditBalance {
    /// Create an empty balance with no expiry.
    #[must_use]
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            chat_credits: 0,
            quiz_gen_credits: 0,
            expires_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Current value of one balance.
    #[must_use]
    pub const fn get(&self, credit_type: CreditType) -> u64 {
        match credit_type {
            CreditType::Chat => self.chat_credits,
            CreditType::QuizGen => self.quiz_gen_credits,
        }
    }

    fn slot(&mut self, credit_type: CreditType) -> &mut u64 {
        match credit_type {
            CreditType::Chat => &mut self.chat_credits,
            CreditType::QuizGen => &mut self.quiz_gen_credits,
        }
    }

    /// Whether the shared expiry has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Label derived from the current counters.
    #[must_use]
    pub const fn plan_label(&self) -> PlanLabel {
        if self.quiz_gen_credits > 0 {
            PlanLabel::Student
        } else if self.chat_credits > REGULAR_CHAT_THRESHOLD {
            PlanLabel::Regular
        } else {
            PlanLabel::Free
        }
    }

    /// Check that `amount` can be drawn from `credit_type` right now.
    ///
    /// # Errors
    ///
    /// `ExpiredCredits` past expiry, `InsufficientCredits` if the balance is short.
    pub fn ensure_spendable(
        &self,
        credit_type: CreditType,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_expired(now) {
            return Err(BillingError::ExpiredCredits);
        }
        let balance = self.get(credit_type);
        if balance < amount {
            return Err(BillingError::InsufficientCredits {
                credit_type,
                balance,
                required: amount,
            });
        }
        Ok(())
    }

    /// Subtract `amount` from one balance and return the new value.
    ///
    /// # Errors
    ///
    /// `InsufficientCredits` if the balance is short. Expiry is not checked.
    pub fn debit(&mut self, credit_type: CreditType, amount: u64, now: DateTime<Utc>) -> Result<u64> {
        let balance = self.get(credit_type);
        let next = balance
            .checked_sub(amount)
            .ok_or(BillingError::InsufficientCredits {
                credit_type,
                balance,
                required: amount,
            })?;
        *self.slot(credit_type) = next;
        self.touch(now);
        Ok(next)
    }

    /// Add `amount` to one balance and return the new value.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` on overflow.
    pub fn credit(&mut self, credit_type: CreditType, amount: u64, now: DateTime<Utc>) -> Result<u64> {
        let next = self
            .get(credit_type)
            .checked_add(amount)
            .ok_or_else(|| BillingError::InvalidAmount(format!("{credit_type} balance overflow")))?;
        *self.slot(credit_type) = next;
        self.touch(now);
        Ok(next)
    }

    /// Apply a signed delta, rejecting any result below zero.
    ///
    /// # Errors
    ///
    /// `NegativeBalance` if the result would be negative.
    pub fn adjust(&mut self, credit_type: CreditType, delta: i64, now: DateTime<Utc>) -> Result<u64> {
        let balance = self.get(credit_type);
        let magnitude = delta.unsigned_abs();
        let next = if delta >= 0 {
            balance.checked_add(magnitude)
        } else {
            balance.checked_sub(magnitude)
        }
        .ok_or(BillingError::NegativeBalance {
            credit_type,
            balance,
            delta,
        })?;
        *self.slot(credit_type) = next;
        self.touch(now);
        Ok(next)
    }

    /// Bump the version and `updated_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Read-only view returned to callers.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> BalanceSnapshot {
        BalanceSnapshot {
            user_id: self.user_id,
            chat_credits: self.chat_credits,
            quiz_gen_credits: self.quiz_gen_credits,
            expires_at: self.expires_at,
            expired: self.is_expired(now),
            plan: self.plan_label(),
        }
    }
}

/// Balance view with derived fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Owner.
    pub user_id: UserId,
    /// Remaining chat credits.
    pub chat_credits: u64,
    /// Remaining quiz-generation credits.
    pub quiz_gen_credits: u64,
    /// Shared expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the expiry has passed.
    pub expired: bool,
    /// Derived plan label.
    pub plan: PlanLabel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn balance(chat: u64, quiz: u64) -> UserCreditBalance {
        let mut b = UserCreditBalance::new(UserId::generate(), Utc::now());
        b.chat_credits = chat;
        b.quiz_gen_credits = quiz;
        b
    }

    #[test]
    fn plan_label_rules() {
        assert_eq!(balance(10, 0).plan_label(), PlanLabel::Free);
        assert_eq!(balance(11, 0).plan_label(), PlanLabel::Regular);
        assert_eq!(balance(0, 1).plan_label(), PlanLabel::Student);
        assert_eq!(balance(50, 3).plan_label(), PlanLabel::Student);
    }

    #[test]
    fn debit_rejects_overdraw_and_leaves_balance() {
        let mut b = balance(0, 0);
        let err = b.debit(CreditType::Chat, 1, Utc::now()).unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits { balance: 0, .. }));
        assert_eq!(b.chat_credits, 0);
        assert_eq!(b.version, 0);
    }

    #[test]
    fn debit_and_credit_bump_version() {
        let mut b = balance(2, 0);
        assert_eq!(b.debit(CreditType::Chat, 1, Utc::now()).unwrap(), 1);
        assert_eq!(b.credit(CreditType::QuizGen, 5, Utc::now()).unwrap(), 5);
        assert_eq!(b.version, 2);
    }

    #[test]
    fn adjust_rejects_negative_result() {
        let mut b = balance(3, 0);
        let err = b.adjust(CreditType::Chat, -4, Utc::now()).unwrap_err();
        assert!(matches!(err, BillingError::NegativeBalance { balance: 3, delta: -4, .. }));
        assert_eq!(b.adjust(CreditType::Chat, -3, Utc::now()).unwrap(), 0);
    }

    #[test]
    fn expired_balance_is_not_spendable() {
        let now = Utc::now();
        let mut b = balance(5, 0);
        b.expires_at = Some(now - Duration::minutes(1));
        assert!(matches!(
            b.ensure_spendable(CreditType::Chat, 1, now),
            Err(BillingError::ExpiredCredits)
        ));
        let snap = b.snapshot(now);
        assert!(snap.expired);
        assert_eq!(snap.chat_credits, 5);
    }
}
