//! Credit ledger.
//!
//! Every balance mutation takes the owner's row lock, reads (or lazily creates)
//! the balance, applies the change to a local copy and commits the new row with
//! its ledger entries in one [`WriteSet`]. The lock is synchronous and none of
//! these functions await, so it can never be held across a network call.

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};

use lexbill_core::transaction::signed;
use lexbill_core::{
    BalanceSnapshot, BillingError, CreditTransaction, CreditType, Payment, PaymentId,
    PaymentStatus, Plan, Result, TransactionType, UserCreditBalance, UserId,
    WELCOME_BONUS_CHAT_CREDITS,
};
use lexbill_store::{RowLock, Store, StoreError, WriteSet};

use crate::notify::{AuditEvent, AuditSink};

/// Read the locked user's balance, creating it with the welcome bonus if missing.
///
/// Provisioning is committed immediately so that it survives even if the
/// caller's own change is rejected.
pub(crate) fn load_balance(
    store: &dyn Store,
    lock: &RowLock,
    now: DateTime<Utc>,
) -> Result<UserCreditBalance> {
    let user_id = *lock.user_id();
    if let Some(balance) = store.get_balance(&user_id)? {
        return Ok(balance);
    }

    let mut balance = UserCreditBalance::new(user_id, now);
    let after = balance.credit(CreditType::Chat, WELCOME_BONUS_CHAT_CREDITS, now)?;
    let bonus = CreditTransaction::new(
        user_id,
        TransactionType::Bonus,
        CreditType::Chat,
        signed(WELCOME_BONUS_CHAT_CREDITS),
        after,
        "Welcome bonus",
        now,
    );
    store.commit(
        &WriteSet::default()
            .with_balance(balance.clone())
            .with_transaction(bonus),
    )?;

    tracing::info!(user_id = %user_id, credits = WELCOME_BONUS_CHAT_CREDITS, "Provisioned balance with welcome bonus");
    Ok(balance)
}

/// Map a failed conditional commit onto the billing taxonomy.
pub(crate) fn commit_error(err: StoreError) -> BillingError {
    match err {
        StoreError::Conflict(msg) => BillingError::ConcurrentModification(msg),
        other => other.into(),
    }
}

/// Per-user credit balances and the append-only transaction log.
pub struct Ledger {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
}

impl Ledger {
    /// Create a ledger over a store.
    pub fn new(store: Arc<dyn Store>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Current balance with derived fields, provisioning it on first access.
    pub fn get_balance(&self, user_id: &UserId) -> Result<BalanceSnapshot> {
        let now = Utc::now();
        if let Some(balance) = self.store.get_balance(user_id)? {
            return Ok(balance.snapshot(now));
        }

        let lock = self.store.lock_user(user_id);
        Ok(load_balance(self.store.as_ref(), &lock, now)?.snapshot(now))
    }

    /// Deduct `amount` credits of one type for a direct usage.
    pub fn check_and_deduct(
        &self,
        user_id: &UserId,
        credit_type: CreditType,
        amount: u64,
    ) -> Result<BalanceSnapshot> {
        if amount == 0 {
            return Err(BillingError::InvalidAmount("deduction must be positive".into()));
        }

        let now = Utc::now();
        let lock = self.store.lock_user(user_id);
        let mut balance = load_balance(self.store.as_ref(), &lock, now)?;

        balance.ensure_spendable(credit_type, amount, now)?;
        let after = balance.debit(credit_type, amount, now)?;
        let usage = CreditTransaction::new(
            *user_id,
            TransactionType::Usage,
            credit_type,
            -signed(amount),
            after,
            format!("{credit_type} usage"),
            now,
        );

        self.store
            .commit(&WriteSet::default().with_balance(balance.clone()).with_transaction(usage))?;

        tracing::debug!(user_id = %user_id, credit_type = %credit_type, amount, balance_after = after, "Credits deducted");
        Ok(balance.snapshot(now))
    }

    /// Add purchased credits and overwrite the expiry.
    pub fn add_credits(
        &self,
        user_id: &UserId,
        chat: u64,
        quiz_gen: u64,
        source: &str,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<BalanceSnapshot> {
        self.grant(user_id, chat, quiz_gen, TransactionType::Purchase, source, Some(new_expiry))
    }

    /// Add bonus credits; the expiry is untouched.
    pub fn grant_bonus(
        &self,
        user_id: &UserId,
        chat: u64,
        quiz_gen: u64,
        reason: &str,
    ) -> Result<BalanceSnapshot> {
        self.grant(user_id, chat, quiz_gen, TransactionType::Bonus, reason, None)
    }

    fn grant(
        &self,
        user_id: &UserId,
        chat: u64,
        quiz_gen: u64,
        kind: TransactionType,
        description: &str,
        expiry: Option<Option<DateTime<Utc>>>,
    ) -> Result<BalanceSnapshot> {
        if chat == 0 && quiz_gen == 0 {
            return Err(BillingError::InvalidAmount("grant must add credits".into()));
        }

        let now = Utc::now();
        let lock = self.store.lock_user(user_id);
        let mut balance = load_balance(self.store.as_ref(), &lock, now)?;

        let mut writes = WriteSet::default();
        for (credit_type, amount) in [(CreditType::Chat, chat), (CreditType::QuizGen, quiz_gen)] {
            if amount > 0 {
                let after = balance.credit(credit_type, amount, now)?;
                writes = writes.with_transaction(CreditTransaction::new(
                    *user_id,
                    kind,
                    credit_type,
                    signed(amount),
                    after,
                    description,
                    now,
                ));
            }
        }
        if let Some(expiry) = expiry {
            balance.expires_at = expiry;
        }

        self.store.commit(&writes.with_balance(balance.clone()))?;

        tracing::info!(user_id = %user_id, chat, quiz_gen, kind = ?kind, "Credits granted");
        Ok(balance.snapshot(now))
    }

    /// Grant a paid plan's credits and mark the payment CREDITED in one commit.
    ///
    /// Already-CREDITED payments are returned unchanged. Only PAID and
    /// PAID_CREDIT_FAILED payments can be credited.
    pub fn credit_payment(&self, payment_id: &PaymentId, plan: &Plan) -> Result<Payment> {
        let owner = self
            .store
            .get_payment(payment_id)?
            .ok_or_else(|| BillingError::not_found("payment", payment_id))?
            .user_id;

        let now = Utc::now();
        let lock = self.store.lock_user(&owner);

        // Re-read under the lock; a concurrent grant may have finished first.
        let payment = self
            .store
            .get_payment(payment_id)?
            .ok_or_else(|| BillingError::not_found("payment", payment_id))?;
        if payment.status == PaymentStatus::Credited {
            return Ok(payment);
        }

        let expected = payment.status;
        let mut credited = payment;
        credited.transition(PaymentStatus::Credited, now)?;

        let mut balance = load_balance(self.store.as_ref(), &lock, now)?;
        let description = format!("Purchase {} (order {})", plan.code, credited.order_code);
        let mut writes = WriteSet::default();
        for (credit_type, amount) in [
            (CreditType::Chat, plan.chat_credits),
            (CreditType::QuizGen, plan.quiz_gen_credits),
        ] {
            if amount > 0 {
                let after = balance.credit(credit_type, amount, now)?;
                writes = writes.with_transaction(
                    CreditTransaction::new(
                        owner,
                        TransactionType::Purchase,
                        credit_type,
                        signed(amount),
                        after,
                        description.as_str(),
                        now,
                    )
                    .with_reference(credited.order_code),
                );
            }
        }
        balance.expires_at = now.checked_add_months(Months::new(plan.duration_months));
        balance.touch(now);

        self.store
            .commit(
                &writes
                    .with_balance(balance)
                    .with_payment(credited.clone(), expected),
            )
            .map_err(commit_error)?;

        tracing::info!(
            user_id = %owner,
            order_code = %credited.order_code,
            plan_code = %plan.code,
            "Payment credited"
        );
        Ok(credited)
    }

    /// Apply a signed admin adjustment to either balance.
    pub fn admin_adjust(
        &self,
        user_id: &UserId,
        chat_delta: i64,
        quiz_delta: i64,
        reason: &str,
        actor: &str,
    ) -> Result<BalanceSnapshot> {
        if chat_delta == 0 && quiz_delta == 0 {
            return Err(BillingError::InvalidAmount("adjustment must be non-zero".into()));
        }

        let now = Utc::now();
        let lock = self.store.lock_user(user_id);
        let mut balance = load_balance(self.store.as_ref(), &lock, now)?;

        let mut writes = WriteSet::default();
        for (credit_type, delta) in [(CreditType::Chat, chat_delta), (CreditType::QuizGen, quiz_delta)] {
            if delta == 0 {
                continue;
            }
            let after = balance.adjust(credit_type, delta, now)?;
            let kind = if delta > 0 {
                TransactionType::AdminAdd
            } else {
                TransactionType::AdminRemove
            };
            writes = writes.with_transaction(
                CreditTransaction::new(*user_id, kind, credit_type, delta, after, reason, now)
                    .with_reference(actor),
            );
        }

        self.store.commit(&writes.with_balance(balance.clone()))?;
        drop(lock);

        self.audit.record(&AuditEvent {
            actor: actor.to_string(),
            user_id: *user_id,
            chat_delta,
            quiz_delta,
            reason: reason.to_string(),
        });
        Ok(balance.snapshot(now))
    }

    /// Ledger entries, newest first.
    pub fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        Ok(self
            .store
            .list_transactions_by_user(user_id, limit, offset)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::TracingNotifier;
    use lexbill_core::OrderCode;
    use lexbill_store::MemoryStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingAudit(Mutex<Vec<AuditEvent>>);

    impl AuditSink for RecordingAudit {
        fn record(&self, event: &AuditEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn ledger() -> (Arc<MemoryStore>, Ledger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), Arc::new(TracingNotifier));
        (store, ledger)
    }

    fn sum_of_amounts(ledger: &Ledger, user_id: &UserId, credit_type: CreditType) -> i64 {
        ledger
            .list_transactions(user_id, usize::MAX, 0)
            .unwrap()
            .iter()
            .filter(|t| t.credit_type == credit_type)
            .map(|t| t.amount)
            .sum()
    }

    #[test]
    fn first_access_provisions_welcome_bonus_once() {
        let (_, ledger) = ledger();
        let user = UserId::generate();

        let first = ledger.get_balance(&user).unwrap();
        let second = ledger.get_balance(&user).unwrap();

        assert_eq!(first.chat_credits, WELCOME_BONUS_CHAT_CREDITS);
        assert_eq!(second.chat_credits, WELCOME_BONUS_CHAT_CREDITS);
        let txs = ledger.list_transactions(&user, 10, 0).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].transaction_type, TransactionType::Bonus);
    }

    #[test]
    fn deduct_from_empty_balance_fails_and_changes_nothing() {
        let (store, ledger) = ledger();
        let user = UserId::generate();
        ledger.get_balance(&user).unwrap();

        let err = ledger
            .check_and_deduct(&user, CreditType::QuizGen, 1)
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits { balance: 0, .. }));
        assert_eq!(store.get_balance(&user).unwrap().unwrap().quiz_gen_credits, 0);
        assert_eq!(ledger.list_transactions(&user, 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn expired_credits_cannot_be_spent() {
        let (store, ledger) = ledger();
        let user = UserId::generate();
        ledger.get_balance(&user).unwrap();
        {
            let _lock = store.lock_user(&user);
            let mut b = store.get_balance(&user).unwrap().unwrap();
            b.expires_at = Some(Utc::now() - chrono::Duration::days(1));
            store.commit(&WriteSet::default().with_balance(b)).unwrap();
        }

        let err = ledger.check_and_deduct(&user, CreditType::Chat, 1).unwrap_err();
        assert!(matches!(err, BillingError::ExpiredCredits));
        assert!(ledger.get_balance(&user).unwrap().expired);
    }

    #[test]
    fn concurrent_deductions_never_go_negative() {
        let (_, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let user = UserId::generate();
        let initial = ledger.get_balance(&user).unwrap().chat_credits;

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.check_and_deduct(&user, CreditType::Chat, 1).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        let final_balance = ledger.get_balance(&user).unwrap().chat_credits;
        assert_eq!(successes as u64, initial);
        assert_eq!(final_balance, 0);
        assert_eq!(sum_of_amounts(&ledger, &user, CreditType::Chat), 0);
    }

    #[test]
    fn admin_adjustments_race_deductions_and_reservations_safely() {
        use crate::billing::reservation::Reservations;

        enum Op {
            Adjust(i64),
            Deduct,
            Reserve(usize),
        }

        let (store, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let reservations = Arc::new(Reservations::new(store, chrono::Duration::minutes(5)));
        let user = UserId::generate();
        let initial = ledger.get_balance(&user).unwrap().chat_credits;

        let mut ops: Vec<Op> = (0..4).map(|_| Op::Adjust(5)).collect();
        ops.extend((0..3).map(|_| Op::Adjust(-4)));
        ops.extend((0..20).map(|_| Op::Deduct));
        ops.extend((0..20).map(Op::Reserve));

        let handles: Vec<_> = ops
            .into_iter()
            .map(|op| {
                let ledger = Arc::clone(&ledger);
                let reservations = Arc::clone(&reservations);
                std::thread::spawn(move || match op {
                    Op::Adjust(delta) => ledger
                        .admin_adjust(&user, delta, 0, "race", "ops")
                        .ok()
                        .map(|_| delta),
                    Op::Deduct => ledger
                        .check_and_deduct(&user, CreditType::Chat, 1)
                        .ok()
                        .map(|_| -1),
                    Op::Reserve(i) => reservations
                        .reserve(&user, &format!("unit-{i}"), CreditType::Chat, "CHAT")
                        .ok()
                        .map(|_| -1),
                })
            })
            .collect();
        let applied: i64 = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .sum();

        let final_balance = ledger.get_balance(&user).unwrap().chat_credits;
        assert_eq!(i64::try_from(final_balance).unwrap(), i64::try_from(initial).unwrap() + applied);

        // Replaying the log oldest first never dips below zero and matches every snapshot.
        let mut txs = ledger.list_transactions(&user, usize::MAX, 0).unwrap();
        txs.reverse();
        let mut running = 0i64;
        for tx in txs.iter().filter(|t| t.credit_type == CreditType::Chat) {
            running += tx.amount;
            assert!(running >= 0);
            assert_eq!(running, i64::try_from(tx.balance_after).unwrap());
        }
        assert_eq!(running, i64::try_from(final_balance).unwrap());
    }

    #[test]
    fn add_credits_overwrites_expiry_and_bonus_keeps_it() {
        let (_, ledger) = ledger();
        let user = UserId::generate();
        let expiry = Utc::now() + chrono::Duration::days(30);

        let after_purchase = ledger
            .add_credits(&user, 100, 20, "Purchase STUDENT", Some(expiry))
            .unwrap();
        assert_eq!(after_purchase.chat_credits, 110);
        assert_eq!(after_purchase.quiz_gen_credits, 20);
        assert_eq!(after_purchase.expires_at, Some(expiry));
        assert_eq!(after_purchase.plan, lexbill_core::PlanLabel::Student);

        let after_bonus = ledger.grant_bonus(&user, 5, 0, "Referral").unwrap();
        assert_eq!(after_bonus.chat_credits, 115);
        assert_eq!(after_bonus.expires_at, Some(expiry));
    }

    #[test]
    fn admin_adjust_rejects_zero_and_negative_results() {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(RecordingAudit::default());
        let ledger = Ledger::new(store, audit.clone());
        let user = UserId::generate();

        assert!(matches!(
            ledger.admin_adjust(&user, 0, 0, "noop", "admin"),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.admin_adjust(&user, -11, 0, "too much", "admin"),
            Err(BillingError::NegativeBalance { .. })
        ));
        assert!(audit.0.lock().is_empty());

        let snapshot = ledger.admin_adjust(&user, -4, 3, "support", "ops").unwrap();
        assert_eq!(snapshot.chat_credits, 6);
        assert_eq!(snapshot.quiz_gen_credits, 3);

        let kinds: Vec<_> = ledger
            .list_transactions(&user, 10, 0)
            .unwrap()
            .iter()
            .map(|t| t.transaction_type)
            .collect();
        assert!(kinds.contains(&TransactionType::AdminAdd));
        assert!(kinds.contains(&TransactionType::AdminRemove));

        let events = audit.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "ops");
    }

    #[test]
    fn credit_payment_is_atomic_and_idempotent() {
        let (store, ledger) = ledger();
        let user = UserId::generate();
        let plan = lexbill_core::PlanCatalog::default()
            .get("STUDENT")
            .cloned()
            .unwrap();
        let now = Utc::now();
        let mut payment = Payment::new(user, "STUDENT", plan.price, OrderCode::new(100_001).unwrap(), now);
        store.insert_payment(&payment).unwrap();
        payment.transition(PaymentStatus::Paid, now).unwrap();
        assert!(store.update_payment_if_status(&payment, PaymentStatus::Pending).unwrap());

        let credited = ledger.credit_payment(&payment.id, &plan).unwrap();
        assert_eq!(credited.status, PaymentStatus::Credited);
        let again = ledger.credit_payment(&payment.id, &plan).unwrap();
        assert_eq!(again.status, PaymentStatus::Credited);

        let balance = ledger.get_balance(&user).unwrap();
        assert_eq!(balance.chat_credits, WELCOME_BONUS_CHAT_CREDITS + plan.chat_credits);
        assert_eq!(balance.quiz_gen_credits, plan.quiz_gen_credits);
        assert!(balance.expires_at.is_some());

        let purchases = ledger
            .list_transactions(&user, 10, 0)
            .unwrap()
            .into_iter()
            .filter(|t| t.transaction_type == TransactionType::Purchase)
            .count();
        assert_eq!(purchases, 2);
    }

    #[test]
    fn pending_payment_cannot_be_credited() {
        let (store, ledger) = ledger();
        let plan = lexbill_core::PlanCatalog::default().get("REGULAR").cloned().unwrap();
        let payment = Payment::new(
            UserId::generate(),
            "REGULAR",
            plan.price,
            OrderCode::new(100_002).unwrap(),
            Utc::now(),
        );
        store.insert_payment(&payment).unwrap();

        assert!(matches!(
            ledger.credit_payment(&payment.id, &plan),
            Err(BillingError::InvalidPaymentTransition { .. })
        ));
    }
}
