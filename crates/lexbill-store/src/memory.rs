//! In-memory storage implementation.
//!
//! All tables sit behind one `RwLock`, so every write (including a whole
//! [`WriteSet`]) is atomic with respect to readers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lexbill_core::{
    ChatMessage, ChatSession, CreditReservation, CreditTransaction, OrderCode, Payment,
    PaymentId, PaymentIdempotencyRecord, PaymentStatus, ReservationId, SessionId,
    UserCreditBalance, UserId,
};
use parking_lot::RwLock;

use crate::error::{Result, StoreError};
use crate::locks::{LockTable, RowLock};
use crate::{Store, WriteSet};

#[derive(Default)]
struct Tables {
    balances: HashMap<UserId, UserCreditBalance>,
    transactions: HashMap<UserId, Vec<CreditTransaction>>,
    reservations: HashMap<ReservationId, CreditReservation>,
    active_by_work_unit: HashMap<String, ReservationId>,
    payments: HashMap<PaymentId, Payment>,
    payments_by_order: HashMap<OrderCode, PaymentId>,
    idempotency: HashMap<String, PaymentIdempotencyRecord>,
    sessions: HashMap<SessionId, ChatSession>,
    messages: HashMap<SessionId, Vec<ChatMessage>>,
    sequences: HashMap<String, i64>,
}

impl Tables {
    fn index_reservation(&mut self, reservation: &CreditReservation) {
        if reservation.is_active() {
            self.active_by_work_unit
                .insert(reservation.work_unit_id.clone(), reservation.id);
        } else if self.active_by_work_unit.get(&reservation.work_unit_id) == Some(&reservation.id) {
            self.active_by_work_unit.remove(&reservation.work_unit_id);
        }
    }
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    locks: LockTable,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_balance(&self, user_id: &UserId) -> Result<Option<UserCreditBalance>> {
        Ok(self.tables.read().balances.get(user_id).cloned())
    }

    fn lock_user(&self, user_id: &UserId) -> RowLock {
        self.locks.lock(user_id)
    }

    fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let tables = self.tables.read();
        Ok(tables
            .transactions
            .get(user_id)
            .map(|txs| txs.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn get_reservation(&self, id: &ReservationId) -> Result<Option<CreditReservation>> {
        Ok(self.tables.read().reservations.get(id).cloned())
    }

    fn active_reservation_for(&self, work_unit_id: &str) -> Result<Option<CreditReservation>> {
        let tables = self.tables.read();
        Ok(tables
            .active_by_work_unit
            .get(work_unit_id)
            .and_then(|id| tables.reservations.get(id))
            .cloned())
    }

    fn list_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CreditReservation>> {
        let tables = self.tables.read();
        let mut expired: Vec<_> = tables
            .active_by_work_unit
            .values()
            .filter_map(|id| tables.reservations.get(id))
            .filter(|r| r.is_active() && r.expires_at < now)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    fn commit(&self, writes: &WriteSet) -> Result<()> {
        let mut tables = self.tables.write();

        if let Some(update) = &writes.payment {
            let current = tables
                .payments
                .get(&update.payment.id)
                .ok_or(StoreError::NotFound)?;
            if current.status != update.expected {
                return Err(StoreError::Conflict(format!(
                    "payment {} is {}, expected {}",
                    current.order_code, current.status, update.expected
                )));
            }
        }

        if let Some(balance) = &writes.balance {
            tables.balances.insert(balance.user_id, balance.clone());
        }
        for tx in &writes.transactions {
            tables
                .transactions
                .entry(tx.user_id)
                .or_default()
                .push(tx.clone());
        }
        if let Some(reservation) = &writes.reservation {
            tables.index_reservation(reservation);
            tables
                .reservations
                .insert(reservation.id, reservation.clone());
        }
        if let Some(update) = &writes.payment {
            if let Some(current) = tables.payments.get_mut(&update.payment.id) {
                replace_payment(current, &update.payment);
            }
        }
        Ok(())
    }

    fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.payments_by_order.contains_key(&payment.order_code) {
            return Err(StoreError::Duplicate(format!(
                "order code {}",
                payment.order_code
            )));
        }
        tables
            .payments_by_order
            .insert(payment.order_code, payment.id);
        tables.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>> {
        Ok(self.tables.read().payments.get(id).cloned())
    }

    fn get_payment_by_order_code(&self, order_code: OrderCode) -> Result<Option<Payment>> {
        let tables = self.tables.read();
        Ok(tables
            .payments_by_order
            .get(&order_code)
            .and_then(|id| tables.payments.get(id))
            .cloned())
    }

    fn update_payment_if_status(&self, payment: &Payment, expected: PaymentStatus) -> Result<bool> {
        let mut tables = self.tables.write();
        let current = tables
            .payments
            .get_mut(&payment.id)
            .ok_or(StoreError::NotFound)?;
        if current.status != expected {
            return Ok(false);
        }
        replace_payment(current, payment);
        Ok(true)
    }

    fn claim_webhook(&self, order_code: OrderCode) -> Result<bool> {
        let mut tables = self.tables.write();
        let id = *tables
            .payments_by_order
            .get(&order_code)
            .ok_or(StoreError::NotFound)?;
        let payment = tables.payments.get_mut(&id).ok_or(StoreError::NotFound)?;
        if payment.webhook_claimed {
            return Ok(false);
        }
        payment.webhook_claimed = true;
        payment.updated_at = Utc::now();
        Ok(true)
    }

    fn list_payments_by_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<Payment>> {
        let tables = self.tables.read();
        let mut payments: Vec<_> = tables
            .payments
            .values()
            .filter(|p| &p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        payments.truncate(limit);
        Ok(payments)
    }

    fn list_payments_by_status(
        &self,
        status: PaymentStatus,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let tables = self.tables.read();
        let mut payments: Vec<_> = tables
            .payments
            .values()
            .filter(|p| p.status == status && p.created_at < created_before)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments.truncate(limit);
        Ok(payments)
    }

    fn delete_payment(&self, id: &PaymentId) -> Result<()> {
        let mut tables = self.tables.write();
        let payment = tables.payments.remove(id).ok_or(StoreError::NotFound)?;
        tables.payments_by_order.remove(&payment.order_code);
        Ok(())
    }

    fn get_idempotency_record(&self, scoped_key: &str) -> Result<Option<PaymentIdempotencyRecord>> {
        Ok(self.tables.read().idempotency.get(scoped_key).cloned())
    }

    fn put_idempotency_record(&self, record: &PaymentIdempotencyRecord) -> Result<()> {
        self.tables
            .write()
            .idempotency
            .insert(record.scoped_key.clone(), record.clone());
        Ok(())
    }

    fn delete_idempotency_record(&self, scoped_key: &str) -> Result<()> {
        self.tables.write().idempotency.remove(scoped_key);
        Ok(())
    }

    fn delete_expired_idempotency_records(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables.write();
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, r| !r.is_expired(now));
        Ok(before - tables.idempotency.len())
    }

    fn insert_session(&self, session: &ChatSession) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(format!("session {}", session.id)));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn get_session(&self, id: &SessionId) -> Result<Option<ChatSession>> {
        Ok(self.tables.read().sessions.get(id).cloned())
    }

    fn update_session_if_version(
        &self,
        session: &ChatSession,
        expected_version: u64,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let current = tables
            .sessions
            .get_mut(&session.id)
            .ok_or(StoreError::NotFound)?;
        if current.version != expected_version {
            return Ok(false);
        }
        *current = session.clone();
        Ok(true)
    }

    fn append_messages(&self, messages: &[ChatMessage]) -> Result<()> {
        let mut tables = self.tables.write();
        for message in messages {
            tables
                .messages
                .entry(message.session_id)
                .or_default()
                .push(message.clone());
        }
        Ok(())
    }

    fn list_messages(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ChatMessage>> {
        let tables = self.tables.read();
        Ok(tables
            .messages
            .get(session_id)
            .map(|msgs| msgs[msgs.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default())
    }

    fn next_sequence(&self, name: &str) -> Result<i64> {
        let mut tables = self.tables.write();
        let value = tables.sequences.entry(name.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

/// Overwrite a stored payment without undoing a webhook claim.
fn replace_payment(slot: &mut Payment, payment: &Payment) {
    let claimed = slot.webhook_claimed || payment.webhook_claimed;
    *slot = payment.clone();
    slot.webhook_claimed = claimed;
}
