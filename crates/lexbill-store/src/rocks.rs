//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Conditional writes (status and version checks, sequences, commits carrying a
//! payment update) run under a single process-wide write lock so that the
//! read-check-write is atomic.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use lexbill_core::{
    ChatMessage, ChatSession, CreditReservation, CreditTransaction, OrderCode, Payment,
    PaymentId, PaymentIdempotencyRecord, PaymentStatus, ReservationId, SessionId,
    UserCreditBalance, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::locks::{LockTable, RowLock};
use crate::schema::{all_column_families, cf};
use crate::{Store, WriteSet};

type Db = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<Db>,
    locks: LockTable,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::info!(path = %path.as_ref().display(), "Opened RocksDB store");

        Ok(Self {
            db: Arc::new(db),
            locks: LockTable::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn read<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collect every key under `prefix` in ascending order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    /// Stage a payment row plus its status and user indexes.
    fn stage_payment(&self, batch: &mut WriteBatch, old: Option<&Payment>, new: &Payment) -> Result<()> {
        let cf_payments = self.cf(cf::PAYMENTS)?;
        let cf_status = self.cf(cf::PAYMENTS_BY_STATUS)?;

        // A webhook claim is never undone by a write based on an older copy.
        if old.is_some_and(|o| o.webhook_claimed && !new.webhook_claimed) {
            let mut claimed = new.clone();
            claimed.webhook_claimed = true;
            batch.put_cf(&cf_payments, keys::payment_key(&new.id), Self::serialize(&claimed)?);
        } else {
            batch.put_cf(&cf_payments, keys::payment_key(&new.id), Self::serialize(new)?);
        }
        match old {
            Some(old) if old.status == new.status => {}
            Some(old) => {
                batch.delete_cf(
                    &cf_status,
                    keys::status_payment_key(old.status, old.created_at, &old.id),
                );
                batch.put_cf(
                    &cf_status,
                    keys::status_payment_key(new.status, new.created_at, &new.id),
                    [],
                );
            }
            None => {
                let cf_order = self.cf(cf::PAYMENTS_BY_ORDER)?;
                let cf_user = self.cf(cf::PAYMENTS_BY_USER)?;
                batch.put_cf(&cf_order, keys::order_code_key(new.order_code), new.id.as_bytes());
                batch.put_cf(
                    &cf_user,
                    keys::user_payment_key(&new.user_id, new.created_at, &new.id),
                    [],
                );
                batch.put_cf(
                    &cf_status,
                    keys::status_payment_key(new.status, new.created_at, &new.id),
                    [],
                );
            }
        }
        Ok(())
    }

    fn load_payments(&self, index_keys: impl IntoIterator<Item = Vec<u8>>, limit: usize) -> Result<Vec<Payment>> {
        let mut payments = Vec::new();
        for key in index_keys {
            if payments.len() >= limit {
                break;
            }
            let id = keys::extract_payment_id(&key)?;
            if let Some(payment) = self.get_payment(&id)? {
                payments.push(payment);
            }
        }
        Ok(payments)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Balances
    // =========================================================================

    fn get_balance(&self, user_id: &UserId) -> Result<Option<UserCreditBalance>> {
        self.read(cf::BALANCES, &keys::balance_key(user_id))
    }

    fn lock_user(&self, user_id: &UserId) -> RowLock {
        self.locks.lock(user_id)
    }

    fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let prefix = keys::user_prefix(user_id);
        let mut index = self.scan_prefix(cf::TRANSACTIONS_BY_USER, &prefix)?;

        // Reverse to get newest first
        index.reverse();

        let mut transactions = Vec::new();
        for (key, _) in index.into_iter().skip(offset).take(limit) {
            let tx_id = keys::extract_transaction_id(&key)?;
            if let Some(tx) = self.read(cf::TRANSACTIONS, &keys::transaction_key(&tx_id))? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    fn get_reservation(&self, id: &ReservationId) -> Result<Option<CreditReservation>> {
        self.read(cf::RESERVATIONS, &keys::reservation_key(id))
    }

    fn active_reservation_for(&self, work_unit_id: &str) -> Result<Option<CreditReservation>> {
        let cf = self.cf(cf::ACTIVE_RESERVATIONS)?;
        let Some(value) = self
            .db
            .get_cf(&cf, work_unit_id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        self.get_reservation(&keys::decode_reservation_id(&value)?)
    }

    fn list_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CreditReservation>> {
        let mut expired = Vec::new();
        for (_, value) in self.scan_prefix(cf::ACTIVE_RESERVATIONS, &[])? {
            let id = keys::decode_reservation_id(&value)?;
            if let Some(reservation) = self.get_reservation(&id)? {
                if reservation.is_active() && reservation.expires_at < now {
                    expired.push(reservation);
                }
            }
        }
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    // =========================================================================
    // Compound Operations
    // =========================================================================

    fn commit(&self, writes: &WriteSet) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();

        if let Some(update) = &writes.payment {
            let current = self
                .get_payment(&update.payment.id)?
                .ok_or(StoreError::NotFound)?;
            if current.status != update.expected {
                return Err(StoreError::Conflict(format!(
                    "payment {} is {}, expected {}",
                    current.order_code, current.status, update.expected
                )));
            }
            self.stage_payment(&mut batch, Some(&current), &update.payment)?;
        }

        if let Some(balance) = &writes.balance {
            let cf_balances = self.cf(cf::BALANCES)?;
            batch.put_cf(
                &cf_balances,
                keys::balance_key(&balance.user_id),
                Self::serialize(balance)?,
            );
        }

        if !writes.transactions.is_empty() {
            let cf_tx = self.cf(cf::TRANSACTIONS)?;
            let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
            for tx in &writes.transactions {
                batch.put_cf(&cf_tx, keys::transaction_key(&tx.id), Self::serialize(tx)?);
                batch.put_cf(&cf_tx_by_user, keys::user_transaction_key(&tx.user_id, &tx.id), []);
            }
        }

        if let Some(reservation) = &writes.reservation {
            let cf_res = self.cf(cf::RESERVATIONS)?;
            let cf_active = self.cf(cf::ACTIVE_RESERVATIONS)?;
            batch.put_cf(
                &cf_res,
                keys::reservation_key(&reservation.id),
                Self::serialize(reservation)?,
            );
            let index_key = reservation.work_unit_id.as_bytes();
            if reservation.is_active() {
                batch.put_cf(&cf_active, index_key, reservation.id.as_bytes());
            } else {
                let indexed = self
                    .db
                    .get_cf(&cf_active, index_key)
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                if indexed.as_deref() == Some(reservation.id.as_bytes().as_slice()) {
                    batch.delete_cf(&cf_active, index_key);
                }
            }
        }

        self.write(batch)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_order = self.cf(cf::PAYMENTS_BY_ORDER)?;
        let taken = self
            .db
            .get_cf(&cf_order, keys::order_code_key(payment.order_code))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if taken {
            return Err(StoreError::Duplicate(format!("order code {}", payment.order_code)));
        }

        let mut batch = WriteBatch::default();
        self.stage_payment(&mut batch, None, payment)?;
        self.write(batch)
    }

    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>> {
        self.read(cf::PAYMENTS, &keys::payment_key(id))
    }

    fn get_payment_by_order_code(&self, order_code: OrderCode) -> Result<Option<Payment>> {
        let cf = self.cf(cf::PAYMENTS_BY_ORDER)?;
        let Some(value) = self
            .db
            .get_cf(&cf, keys::order_code_key(order_code))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        self.get_payment(&keys::extract_payment_id(&value)?)
    }

    fn update_payment_if_status(&self, payment: &Payment, expected: PaymentStatus) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let current = self.get_payment(&payment.id)?.ok_or(StoreError::NotFound)?;
        if current.status != expected {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        self.stage_payment(&mut batch, Some(&current), payment)?;
        self.write(batch)?;
        Ok(true)
    }

    fn claim_webhook(&self, order_code: OrderCode) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut payment = self
            .get_payment_by_order_code(order_code)?
            .ok_or(StoreError::NotFound)?;
        if payment.webhook_claimed {
            return Ok(false);
        }
        let current = payment.clone();
        payment.webhook_claimed = true;
        payment.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        self.stage_payment(&mut batch, Some(&current), &payment)?;
        self.write(batch)?;
        Ok(true)
    }

    fn list_payments_by_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<Payment>> {
        let mut index = self.scan_prefix(cf::PAYMENTS_BY_USER, &keys::user_prefix(user_id))?;
        index.reverse();
        self.load_payments(index.into_iter().map(|(k, _)| k), limit)
    }

    fn list_payments_by_status(
        &self,
        status: PaymentStatus,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let index = self.scan_prefix(cf::PAYMENTS_BY_STATUS, &keys::status_prefix(status))?;
        let cutoff = keys::status_payment_key(status, created_before, &PaymentId::from_uuid(uuid::Uuid::nil()));
        self.load_payments(
            index.into_iter().map(|(k, _)| k).take_while(|k| *k < cutoff),
            limit,
        )
    }

    fn delete_payment(&self, id: &PaymentId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let payment = self.get_payment(id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(cf::PAYMENTS)?, keys::payment_key(id));
        batch.delete_cf(&self.cf(cf::PAYMENTS_BY_ORDER)?, keys::order_code_key(payment.order_code));
        batch.delete_cf(
            &self.cf(cf::PAYMENTS_BY_USER)?,
            keys::user_payment_key(&payment.user_id, payment.created_at, id),
        );
        batch.delete_cf(
            &self.cf(cf::PAYMENTS_BY_STATUS)?,
            keys::status_payment_key(payment.status, payment.created_at, id),
        );
        self.write(batch)
    }

    // =========================================================================
    // Idempotency Records
    // =========================================================================

    fn get_idempotency_record(&self, scoped_key: &str) -> Result<Option<PaymentIdempotencyRecord>> {
        self.read(cf::IDEMPOTENCY, scoped_key.as_bytes())
    }

    fn put_idempotency_record(&self, record: &PaymentIdempotencyRecord) -> Result<()> {
        let cf = self.cf(cf::IDEMPOTENCY)?;
        self.db
            .put_cf(&cf, record.scoped_key.as_bytes(), Self::serialize(record)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn delete_idempotency_record(&self, scoped_key: &str) -> Result<()> {
        let cf = self.cf(cf::IDEMPOTENCY)?;
        self.db
            .delete_cf(&cf, scoped_key.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn delete_expired_idempotency_records(&self, now: DateTime<Utc>) -> Result<usize> {
        let cf = self.cf(cf::IDEMPOTENCY)?;
        let mut batch = WriteBatch::default();
        let mut deleted = 0;
        for (key, value) in self.scan_prefix(cf::IDEMPOTENCY, &[])? {
            let record: PaymentIdempotencyRecord = Self::deserialize(&value)?;
            if record.is_expired(now) {
                batch.delete_cf(&cf, key);
                deleted += 1;
            }
        }
        self.write(batch)?;
        Ok(deleted)
    }

    // =========================================================================
    // Chat Sessions
    // =========================================================================

    fn insert_session(&self, session: &ChatSession) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.get_session(&session.id)?.is_some() {
            return Err(StoreError::Duplicate(format!("session {}", session.id)));
        }
        let cf = self.cf(cf::SESSIONS)?;
        self.db
            .put_cf(&cf, keys::session_key(&session.id), Self::serialize(session)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_session(&self, id: &SessionId) -> Result<Option<ChatSession>> {
        self.read(cf::SESSIONS, &keys::session_key(id))
    }

    fn update_session_if_version(
        &self,
        session: &ChatSession,
        expected_version: u64,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let current = self.get_session(&session.id)?.ok_or(StoreError::NotFound)?;
        if current.version != expected_version {
            return Ok(false);
        }
        let cf = self.cf(cf::SESSIONS)?;
        self.db
            .put_cf(&cf, keys::session_key(&session.id), Self::serialize(session)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(true)
    }

    fn append_messages(&self, messages: &[ChatMessage]) -> Result<()> {
        let cf = self.cf(cf::MESSAGES)?;
        let mut batch = WriteBatch::default();
        for message in messages {
            batch.put_cf(
                &cf,
                keys::message_key(&message.session_id, message.created_at, message.id.as_bytes()),
                Self::serialize(message)?,
            );
        }
        self.write(batch)
    }

    fn list_messages(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ChatMessage>> {
        let entries = self.scan_prefix(cf::MESSAGES, &keys::session_key(session_id))?;
        let start = entries.len().saturating_sub(limit);
        entries[start..]
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }

    // =========================================================================
    // Sequences
    // =========================================================================

    fn next_sequence(&self, name: &str) -> Result<i64> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::SEQUENCES)?;
        let current = self
            .db
            .get_cf(&cf, name.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|bytes| {
                <[u8; 8]>::try_from(bytes.as_slice())
                    .map(i64::from_be_bytes)
                    .map_err(|_| StoreError::Serialization(format!("corrupt sequence {name}")))
            })
            .transpose()?
            .unwrap_or(0);
        let next = current + 1;
        self.db
            .put_cf(&cf, name.as_bytes(), next.to_be_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lexbill_core::{CreditType, MessageRole, ReservationState, TransactionType};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn payment(user_id: UserId, code: i64, created_at: DateTime<Utc>) -> Payment {
        Payment::new(user_id, "REGULAR", 159_000, OrderCode::new(code).unwrap(), created_at)
    }

    #[test]
    fn balance_and_transactions_commit() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let mut balance = UserCreditBalance::new(user_id, Utc::now());
        balance.chat_credits = 10;

        let tx1 = CreditTransaction::new(user_id, TransactionType::Bonus, CreditType::Chat, 10, 10, "first", Utc::now());
        std::thread::sleep(std::time::Duration::from_millis(2)); // Ensure different ULIDs
        let tx2 = CreditTransaction::new(user_id, TransactionType::Usage, CreditType::Chat, -1, 9, "second", Utc::now());

        store
            .commit(
                &WriteSet::default()
                    .with_balance(balance)
                    .with_transaction(tx1)
                    .with_transaction(tx2),
            )
            .unwrap();

        assert_eq!(store.get_balance(&user_id).unwrap().unwrap().chat_credits, 10);
        let txs = store.list_transactions_by_user(&user_id, 10, 0).unwrap();
        assert_eq!(txs[0].description, "second");
        assert_eq!(txs[1].description, "first");
        let page2 = store.list_transactions_by_user(&user_id, 1, 1).unwrap();
        assert_eq!(page2[0].description, "first");
    }

    #[test]
    fn reservation_active_index() {
        let (store, _dir) = create_test_store();
        let mut r = CreditReservation::new(
            UserId::generate(),
            "quiz-1",
            CreditType::QuizGen,
            1,
            "QUIZ_GEN",
            Utc::now() - Duration::minutes(10),
            Duration::minutes(5),
        );
        store.commit(&WriteSet::default().with_reservation(r.clone())).unwrap();
        assert_eq!(store.active_reservation_for("quiz-1").unwrap().unwrap().id, r.id);
        assert_eq!(store.list_expired_reservations(Utc::now(), 10).unwrap().len(), 1);

        r.resolve(ReservationState::Confirmed, Utc::now()).unwrap();
        store.commit(&WriteSet::default().with_reservation(r.clone())).unwrap();
        assert!(store.active_reservation_for("quiz-1").unwrap().is_none());
        assert_eq!(
            store.get_reservation(&r.id).unwrap().unwrap().state,
            ReservationState::Confirmed
        );
    }

    #[test]
    fn payment_indexes_follow_status_changes() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let now = Utc::now();
        let mut old = payment(user_id, 100_001, now - Duration::hours(2));
        let recent = payment(user_id, 100_002, now - Duration::minutes(1));
        store.insert_payment(&old).unwrap();
        store.insert_payment(&recent).unwrap();
        assert!(matches!(store.insert_payment(&recent), Err(StoreError::Duplicate(_))));

        let stale = store
            .list_payments_by_status(PaymentStatus::Pending, now - Duration::minutes(30), 10)
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);

        old.status = PaymentStatus::Expired;
        assert!(store.update_payment_if_status(&old, PaymentStatus::Pending).unwrap());
        assert!(!store.update_payment_if_status(&old, PaymentStatus::Pending).unwrap());
        assert!(store
            .list_payments_by_status(PaymentStatus::Pending, now - Duration::minutes(30), 10)
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_payments_by_status(PaymentStatus::Expired, now, 10)
                .unwrap()
                .len(),
            1
        );

        let mine = store.list_payments_by_user(&user_id, 10).unwrap();
        assert_eq!(mine[0].id, recent.id);

        store.delete_payment(&old.id).unwrap();
        assert!(store.get_payment_by_order_code(old.order_code).unwrap().is_none());
    }

    #[test]
    fn webhook_claim_is_single_shot() {
        let (store, _dir) = create_test_store();
        let p = payment(UserId::generate(), 100_010, Utc::now());
        store.insert_payment(&p).unwrap();
        assert!(store.claim_webhook(p.order_code).unwrap());
        assert!(!store.claim_webhook(p.order_code).unwrap());
        assert!(store.get_payment(&p.id).unwrap().unwrap().webhook_claimed);
    }

    #[test]
    fn stale_status_update_keeps_the_claim() {
        let (store, _dir) = create_test_store();
        let p = payment(UserId::generate(), 100_011, Utc::now());
        store.insert_payment(&p).unwrap();

        let mut stale = store.get_payment(&p.id).unwrap().unwrap();
        assert!(store.claim_webhook(p.order_code).unwrap());

        stale.checkout_url = Some("https://pay.example/link".into());
        assert!(store.update_payment_if_status(&stale, PaymentStatus::Pending).unwrap());
        let stored = store.get_payment(&p.id).unwrap().unwrap();
        assert_eq!(stored.checkout_url.as_deref(), Some("https://pay.example/link"));
        assert!(stored.webhook_claimed);
    }

    #[test]
    fn sessions_messages_and_sequences() {
        let (store, _dir) = create_test_store();
        let mut session = ChatSession::new(UserId::generate(), "t", Utc::now());
        store.insert_session(&session).unwrap();
        session.version = 1;
        assert!(store.update_session_if_version(&session, 0).unwrap());
        assert!(!store.update_session_if_version(&session, 0).unwrap());

        let base = Utc::now();
        let messages: Vec<_> = (0..4)
            .map(|i| {
                ChatMessage::new(session.id, MessageRole::Assistant, format!("m{i}"), base + Duration::milliseconds(i))
            })
            .collect();
        store.append_messages(&messages).unwrap();
        let tail = store.list_messages(&session.id, 2).unwrap();
        assert_eq!(tail[0].content, "m2");
        assert_eq!(tail[1].content, "m3");

        assert_eq!(store.next_sequence("order_code").unwrap(), 1);
        assert_eq!(store.next_sequence("order_code").unwrap(), 2);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let user_id = UserId::generate();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            let balance = UserCreditBalance::new(user_id, Utc::now());
            store.commit(&WriteSet::default().with_balance(balance)).unwrap();
            store.next_sequence("order_code").unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert!(store.get_balance(&user_id).unwrap().is_some());
        assert_eq!(store.next_sequence("order_code").unwrap(), 2);
    }
}
