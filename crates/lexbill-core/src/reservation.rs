//! Credit reservations.
//!
//! A reservation holds credits already deducted from a balance while a unit of
//! billable work is in flight. It ends exactly once, either CONFIRMED (credit
//! consumed) or RELEASED (credit returned).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::balance::CreditType;
use crate::error::{BillingError, Result};
use crate::{ReservationId, UserId};

/// Reservation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Credits held, work in flight.
    Active,
    /// Work succeeded, credits consumed.
    Confirmed,
    /// Work failed or expired, credits returned.
    Released,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Confirmed => "CONFIRMED",
            Self::Released => "RELEASED",
        })
    }
}

/// A hold against one balance for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReservation {
    /// Identifier.
    pub id: ReservationId,
    /// Owner.
    pub user_id: UserId,
    /// The unit of work (chat session id or quiz generation id).
    pub work_unit_id: String,
    /// Which balance was drawn.
    pub credit_type: CreditType,
    /// Amount held.
    pub amount: u64,
    /// Current state.
    pub state: ReservationState,
    /// Operation label, e.g. `CHAT` or `QUIZ_GEN`.
    pub operation: String,
    /// When the hold was taken.
    pub created_at: DateTime<Utc>,
    /// Deadline after which the sweeper releases it.
    pub expires_at: DateTime<Utc>,
    /// When it left ACTIVE.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CreditReservation {
    /// Create a new ACTIVE reservation.
    #[must_use]
    pub fn new(
        user_id: UserId,
        work_unit_id: impl Into<String>,
        credit_type: CreditType,
        amount: u64,
        operation: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: ReservationId::generate(),
            user_id,
            work_unit_id: work_unit_id.into(),
            credit_type,
            amount,
            state: ReservationState::Active,
            operation: operation.into(),
            created_at: now,
            expires_at: now + ttl,
            resolved_at: None,
        }
    }

    /// Whether the reservation is still holding credits.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Active
    }

    /// Move to a terminal state.
    ///
    /// # Errors
    ///
    /// `InvalidReservationState` unless the reservation is ACTIVE and `to` is terminal.
    pub fn resolve(&mut self, to: ReservationState, now: DateTime<Utc>) -> Result<()> {
        if !self.is_active() || to == ReservationState::Active {
            return Err(BillingError::InvalidReservationState {
                reservation_id: self.id.to_string(),
                state: self.state.to_string(),
            });
        }
        self.state = to;
        self.resolved_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> CreditReservation {
        CreditReservation::new(
            UserId::generate(),
            "session-1",
            CreditType::Chat,
            1,
            "CHAT",
            Utc::now(),
            Duration::minutes(5),
        )
    }

    #[test]
    fn resolves_once() {
        let mut r = active();
        r.resolve(ReservationState::Confirmed, Utc::now()).unwrap();
        assert_eq!(r.state, ReservationState::Confirmed);
        assert!(r.resolved_at.is_some());

        let err = r.resolve(ReservationState::Released, Utc::now()).unwrap_err();
        assert!(matches!(err, BillingError::InvalidReservationState { .. }));
    }

    #[test]
    fn cannot_resolve_back_to_active() {
        let mut r = active();
        assert!(r.resolve(ReservationState::Active, Utc::now()).is_err());
        assert!(r.is_active());
    }
}
