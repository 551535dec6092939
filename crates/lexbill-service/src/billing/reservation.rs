//! Credit reservations: reserve, confirm, refund and the TTL sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use lexbill_core::transaction::signed;
use lexbill_core::{
    BillingError, CreditReservation, CreditTransaction, CreditType, ReservationId,
    ReservationState, Result, TransactionType, UserId,
};
use lexbill_store::{Store, WriteSet};

use super::ledger::load_balance;

/// Credits held per reservation.
const RESERVATION_AMOUNT: u64 = 1;

/// Expired reservations released per sweep.
const SWEEP_BATCH: usize = 100;

/// Holds against balances for in-flight billable work.
pub struct Reservations {
    store: Arc<dyn Store>,
    ttl: chrono::Duration,
}

impl Reservations {
    /// Create the component with a sweep deadline.
    pub fn new(store: Arc<dyn Store>, ttl: chrono::Duration) -> Self {
        Self { store, ttl }
    }

    /// Deduct one credit and open an ACTIVE reservation for `work_unit_id`.
    ///
    /// Fails with `ConcurrentModification` if the work unit already has an
    /// ACTIVE reservation.
    pub fn reserve(
        &self,
        user_id: &UserId,
        work_unit_id: &str,
        credit_type: CreditType,
        operation: &str,
    ) -> Result<CreditReservation> {
        let now = Utc::now();
        let lock = self.store.lock_user(user_id);

        if let Some(existing) = self.store.active_reservation_for(work_unit_id)? {
            return Err(BillingError::ConcurrentModification(format!(
                "work unit {work_unit_id} already holds reservation {}",
                existing.id
            )));
        }

        let mut balance = load_balance(self.store.as_ref(), &lock, now)?;
        balance.ensure_spendable(credit_type, RESERVATION_AMOUNT, now)?;
        let after = balance.debit(credit_type, RESERVATION_AMOUNT, now)?;

        let reservation = CreditReservation::new(
            *user_id,
            work_unit_id,
            credit_type,
            RESERVATION_AMOUNT,
            operation,
            now,
            self.ttl,
        );
        let entry = CreditTransaction::new(
            *user_id,
            TransactionType::Reserve,
            credit_type,
            -signed(RESERVATION_AMOUNT),
            after,
            format!("Reserved for {operation}"),
            now,
        )
        .with_reference(reservation.id);

        self.store.commit(
            &WriteSet::default()
                .with_balance(balance)
                .with_transaction(entry)
                .with_reservation(reservation.clone()),
        )?;

        tracing::debug!(
            user_id = %user_id,
            reservation_id = %reservation.id,
            work_unit_id = %work_unit_id,
            "Credit reserved"
        );
        Ok(reservation)
    }

    /// Mark an ACTIVE reservation CONFIRMED; the credit stays spent.
    pub fn confirm(&self, id: &ReservationId) -> Result<CreditReservation> {
        let (lock, mut reservation) = self.lock_active(id)?;
        let now = Utc::now();

        reservation.resolve(ReservationState::Confirmed, now)?;
        let balance = load_balance(self.store.as_ref(), &lock, now)?;
        let entry = CreditTransaction::new(
            reservation.user_id,
            TransactionType::Confirm,
            reservation.credit_type,
            0,
            balance.get(reservation.credit_type),
            format!("Confirmed {}", reservation.operation),
            now,
        )
        .with_reference(reservation.id);

        self.store.commit(
            &WriteSet::default()
                .with_transaction(entry)
                .with_reservation(reservation.clone()),
        )?;

        tracing::debug!(reservation_id = %reservation.id, "Reservation confirmed");
        Ok(reservation)
    }

    /// Mark an ACTIVE reservation RELEASED and return the credit.
    pub fn refund(&self, id: &ReservationId) -> Result<CreditReservation> {
        let (lock, reservation) = self.lock_active(id)?;
        let released = self.release_locked(&lock, reservation, "Released")?;
        tracing::info!(reservation_id = %released.id, user_id = %released.user_id, "Reservation refunded");
        Ok(released)
    }

    /// Release every ACTIVE reservation past its deadline.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut released = 0;
        for stale in self.store.list_expired_reservations(now, SWEEP_BATCH)? {
            let lock = self.store.lock_user(&stale.user_id);
            let Some(current) = self.store.get_reservation(&stale.id)? else {
                continue;
            };
            if !current.is_active() {
                continue;
            }

            tracing::warn!(
                reservation_id = %current.id,
                user_id = %current.user_id,
                work_unit_id = %current.work_unit_id,
                expired_at = %current.expires_at,
                "Releasing orphaned reservation"
            );
            self.release_locked(&lock, current, "Released by expiry sweep")?;
            released += 1;
        }
        Ok(released)
    }

    /// Lock the owner and re-read the reservation, requiring it to be ACTIVE.
    fn lock_active(&self, id: &ReservationId) -> Result<(lexbill_store::RowLock, CreditReservation)> {
        let owner = self
            .store
            .get_reservation(id)?
            .ok_or_else(|| BillingError::not_found("reservation", id))?
            .user_id;

        let lock = self.store.lock_user(&owner);
        let reservation = self
            .store
            .get_reservation(id)?
            .ok_or_else(|| BillingError::not_found("reservation", id))?;

        if !reservation.is_active() {
            let err = BillingError::InvalidReservationState {
                reservation_id: id.to_string(),
                state: reservation.state.to_string(),
            };
            tracing::error!(error = %err, "Reservation already resolved");
            return Err(err);
        }
        Ok((lock, reservation))
    }

    fn release_locked(
        &self,
        lock: &lexbill_store::RowLock,
        mut reservation: CreditReservation,
        description: &str,
    ) -> Result<CreditReservation> {
        let now = Utc::now();
        reservation.resolve(ReservationState::Released, now)?;

        let mut balance = load_balance(self.store.as_ref(), lock, now)?;
        let after = balance.credit(reservation.credit_type, reservation.amount, now)?;
        let entry = CreditTransaction::new(
            reservation.user_id,
            TransactionType::Release,
            reservation.credit_type,
            signed(reservation.amount),
            after,
            format!("{description}: {}", reservation.operation),
            now,
        )
        .with_reference(reservation.id);

        self.store.commit(
            &WriteSet::default()
                .with_balance(balance)
                .with_transaction(entry)
                .with_reservation(reservation.clone()),
        )?;
        Ok(reservation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexbill_core::WELCOME_BONUS_CHAT_CREDITS;
    use lexbill_store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Reservations) {
        let store = Arc::new(MemoryStore::new());
        let reservations = Reservations::new(store.clone(), chrono::Duration::minutes(5));
        (store, reservations)
    }

    fn set_chat(store: &MemoryStore, user: &UserId, chat: u64) {
        let lock = store.lock_user(user);
        let mut balance = load_balance(store, &lock, Utc::now()).unwrap();
        balance.chat_credits = chat;
        store.commit(&WriteSet::default().with_balance(balance)).unwrap();
    }

    fn chat_balance(store: &MemoryStore, user: &UserId) -> u64 {
        store.get_balance(user).unwrap().unwrap().chat_credits
    }

    #[test]
    fn reserve_then_refund_restores_balance() {
        let (store, reservations) = setup();
        let user = UserId::generate();

        let r = reservations.reserve(&user, "session-a", CreditType::Chat, "CHAT").unwrap();
        assert_eq!(chat_balance(&store, &user), WELCOME_BONUS_CHAT_CREDITS - 1);

        let released = reservations.refund(&r.id).unwrap();
        assert_eq!(released.state, ReservationState::Released);
        assert_eq!(chat_balance(&store, &user), WELCOME_BONUS_CHAT_CREDITS);
    }

    #[test]
    fn reserve_then_confirm_keeps_deduction() {
        let (store, reservations) = setup();
        let user = UserId::generate();

        let r = reservations.reserve(&user, "session-b", CreditType::Chat, "CHAT").unwrap();
        reservations.confirm(&r.id).unwrap();
        assert_eq!(chat_balance(&store, &user), WELCOME_BONUS_CHAT_CREDITS - 1);

        let txs = store.list_transactions_by_user(&user, 10, 0).unwrap();
        assert_eq!(txs[0].transaction_type, TransactionType::Confirm);
        assert_eq!(txs[0].amount, 0);
    }

    #[test]
    fn terminal_reservations_reject_second_resolution() {
        let (_, reservations) = setup();
        let user = UserId::generate();

        let confirmed = reservations.reserve(&user, "s1", CreditType::Chat, "CHAT").unwrap();
        reservations.confirm(&confirmed.id).unwrap();
        assert!(matches!(
            reservations.confirm(&confirmed.id),
            Err(BillingError::InvalidReservationState { .. })
        ));
        assert!(matches!(
            reservations.refund(&confirmed.id),
            Err(BillingError::InvalidReservationState { .. })
        ));

        let released = reservations.reserve(&user, "s2", CreditType::Chat, "CHAT").unwrap();
        reservations.refund(&released.id).unwrap();
        assert!(reservations.refund(&released.id).is_err());
    }

    #[test]
    fn last_credit_reserves_once_per_work_unit() {
        let (store, reservations) = setup();
        let user = UserId::generate();
        set_chat(&store, &user, 1);

        let r = reservations.reserve(&user, "session-c", CreditType::Chat, "CHAT").unwrap();
        assert_eq!(chat_balance(&store, &user), 0);
        assert!(r.is_active());

        assert!(matches!(
            reservations.reserve(&user, "session-c", CreditType::Chat, "CHAT"),
            Err(BillingError::ConcurrentModification(_))
        ));
        assert!(matches!(
            reservations.reserve(&user, "session-d", CreditType::Chat, "CHAT"),
            Err(BillingError::InsufficientCredits { .. })
        ));
    }

    #[test]
    fn sweep_releases_only_expired_active_reservations() {
        let (store, reservations) = setup();
        let user = UserId::generate();

        let stale = reservations.reserve(&user, "old", CreditType::Chat, "CHAT").unwrap();
        let confirmed = reservations.reserve(&user, "done", CreditType::Chat, "CHAT").unwrap();
        reservations.confirm(&confirmed.id).unwrap();
        reservations.reserve(&user, "fresh", CreditType::Chat, "CHAT").unwrap();

        let later = Utc::now() + chrono::Duration::minutes(6);
        let fresh_deadline = store
            .active_reservation_for("fresh")
            .unwrap()
            .unwrap()
            .expires_at;
        assert!(fresh_deadline < later);

        // Only reservations that expired before `later` and are still ACTIVE: "old" and "fresh".
        let released = reservations.sweep_expired(later).unwrap();
        assert_eq!(released, 2);
        assert_eq!(
            store.get_reservation(&stale.id).unwrap().unwrap().state,
            ReservationState::Released
        );
        assert_eq!(
            store.get_reservation(&confirmed.id).unwrap().unwrap().state,
            ReservationState::Confirmed
        );
        assert_eq!(chat_balance(&store, &user), WELCOME_BONUS_CHAT_CREDITS - 1);
        assert_eq!(reservations.sweep_expired(later).unwrap(), 0);
    }

    #[test]
    fn concurrent_reserves_never_go_negative() {
        let (store, reservations) = setup();
        let reservations = Arc::new(reservations);
        let user = UserId::generate();
        set_chat(&store, &user, 3);

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let reservations = Arc::clone(&reservations);
                std::thread::spawn(move || {
                    reservations
                        .reserve(&user, &format!("unit-{i}"), CreditType::Chat, "CHAT")
                        .is_ok()
                })
            })
            .collect();
        let ok = handles.into_iter().filter_map(|h| h.join().ok()).filter(|ok| *ok).count();

        assert_eq!(ok, 3);
        assert_eq!(chat_balance(&store, &user), 0);
    }
}
