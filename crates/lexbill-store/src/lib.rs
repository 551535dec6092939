//! Storage layer for lexbill.
//!
//! This crate owns every piece of persisted billing state: balances, the
//! transaction log, reservations, payments, idempotency records, chat sessions,
//! chat messages and named sequences.
//!
//! # Backends
//!
//! - [`MemoryStore`]: always available, used by tests and single-process deployments.
//! - `RocksStore`: `RocksDB` with column families and CBOR values, behind the
//!   `rocksdb-backend` feature.
//!
//! # Concurrency primitives
//!
//! - [`Store::lock_user`] returns an exclusive per-user [`RowLock`]. Balance and
//!   reservation writes go through [`Store::commit`] while that lock is held.
//! - [`Store::update_payment_if_status`] and [`Store::claim_webhook`] are
//!   compare-and-set operations on a single payment.
//! - [`Store::update_session_if_version`] is an optimistic version check.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use lexbill_core::{UserCreditBalance, UserId};
//! use lexbill_store::{MemoryStore, Store, WriteSet};
//!
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//!
//! let _lock = store.lock_user(&user_id);
//! let balance = UserCreditBalance::new(user_id, Utc::now());
//! store.commit(&WriteSet::default().with_balance(balance)).unwrap();
//! assert!(store.get_balance(&user_id).unwrap().is_some());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod locks;
pub mod memory;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use locks::{LockTable, RowLock};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use lexbill_core::{
    ChatMessage, ChatSession, CreditReservation, CreditTransaction, OrderCode, Payment,
    PaymentId, PaymentIdempotencyRecord, PaymentStatus, ReservationId, SessionId,
    UserCreditBalance, UserId,
};

/// A payment write guarded by the status it is expected to have.
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    /// The new payment row.
    pub payment: Payment,
    /// The status the stored row must currently have.
    pub expected: PaymentStatus,
}

/// A group of writes applied atomically by [`Store::commit`].
///
/// Either every part is written or none is. If `payment` is present and the
/// stored status differs from `expected`, nothing is written and
/// `StoreError::Conflict` is returned.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    /// Updated balance row.
    pub balance: Option<UserCreditBalance>,
    /// Ledger entries to append.
    pub transactions: Vec<CreditTransaction>,
    /// New or updated reservation.
    pub reservation: Option<CreditReservation>,
    /// Conditional payment update.
    pub payment: Option<PaymentUpdate>,
}

impl WriteSet {
    /// Set the balance row.
    #[must_use]
    pub fn with_balance(mut self, balance: UserCreditBalance) -> Self {
        self.balance = Some(balance);
        self
    }

    /// Append a ledger entry.
    #[must_use]
    pub fn with_transaction(mut self, transaction: CreditTransaction) -> Self {
        self.transactions.push(transaction);
        self
    }

    /// Set the reservation row.
    #[must_use]
    pub fn with_reservation(mut self, reservation: CreditReservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    /// Set a conditional payment update.
    #[must_use]
    pub fn with_payment(mut self, payment: Payment, expected: PaymentStatus) -> Self {
        self.payment = Some(PaymentUpdate { payment, expected });
        self
    }
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (in-memory, `RocksDB`). All methods are synchronous; callers in async code must
/// not hold a [`RowLock`] across an `.await`.
pub trait Store: Send + Sync {
    // =========================================================================
    // Balances
    // =========================================================================

    /// Get a user's balance row.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_balance(&self, user_id: &UserId) -> Result<Option<UserCreditBalance>>;

    /// Acquire the user's exclusive row lock.
    fn lock_user(&self, user_id: &UserId) -> RowLock;

    /// Drop idle row locks. Returns how many were released.
    fn prune_locks(&self) -> usize;

    // =========================================================================
    // Transactions
    // =========================================================================

    /// List a user's ledger entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Get a reservation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_reservation(&self, id: &ReservationId) -> Result<Option<CreditReservation>>;

    /// Get the ACTIVE reservation for a work unit, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn active_reservation_for(&self, work_unit_id: &str) -> Result<Option<CreditReservation>>;

    /// List ACTIVE reservations whose `expires_at` is before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CreditReservation>>;

    // =========================================================================
    // Compound Operations
    // =========================================================================

    /// Apply a [`WriteSet`] atomically.
    ///
    /// # Errors
    ///
    /// - `StoreError::Conflict` if the payment's stored status is not the expected one.
    /// - `StoreError::NotFound` if the payment does not exist.
    fn commit(&self, writes: &WriteSet) -> Result<()>;

    // =========================================================================
    // Payments
    // =========================================================================

    /// Insert a new payment.
    ///
    /// # Errors
    ///
    /// `StoreError::Duplicate` if the order code is already used.
    fn insert_payment(&self, payment: &Payment) -> Result<()>;

    /// Get a payment by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>>;

    /// Get a payment by its order code.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_payment_by_order_code(&self, order_code: OrderCode) -> Result<Option<Payment>>;

    /// Replace a payment only if its stored status equals `expected`.
    ///
    /// Returns `false` without writing if the status differs. A stored
    /// `webhook_claimed` flag is kept even if `payment` predates the claim.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the payment does not exist.
    fn update_payment_if_status(&self, payment: &Payment, expected: PaymentStatus) -> Result<bool>;

    /// Flip `webhook_claimed` from false to true.
    ///
    /// Returns `true` for exactly one caller per payment.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if no payment has this order code.
    fn claim_webhook(&self, order_code: OrderCode) -> Result<bool>;

    /// List a user's payments, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_payments_by_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<Payment>>;

    /// List payments with `status` created before `created_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_payments_by_status(
        &self,
        status: PaymentStatus,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>>;

    /// Delete a payment and its indexes.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the payment does not exist.
    fn delete_payment(&self, id: &PaymentId) -> Result<()>;

    // =========================================================================
    // Idempotency Records
    // =========================================================================

    /// Get a record by scoped key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_idempotency_record(&self, scoped_key: &str) -> Result<Option<PaymentIdempotencyRecord>>;

    /// Insert or replace a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_idempotency_record(&self, record: &PaymentIdempotencyRecord) -> Result<()>;

    /// Delete a record. Missing records are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_idempotency_record(&self, scoped_key: &str) -> Result<()>;

    /// Delete every record past its `expires_at`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_expired_idempotency_records(&self, now: DateTime<Utc>) -> Result<usize>;

    // =========================================================================
    // Chat Sessions
    // =========================================================================

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// `StoreError::Duplicate` if the ID exists.
    fn insert_session(&self, session: &ChatSession) -> Result<()>;

    /// Get a session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_session(&self, id: &SessionId) -> Result<Option<ChatSession>>;

    /// Replace a session only if its stored version equals `expected_version`.
    ///
    /// The caller bumps `session.version`. Returns `false` on a version mismatch.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the session does not exist.
    fn update_session_if_version(&self, session: &ChatSession, expected_version: u64)
        -> Result<bool>;

    /// Append messages to their sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn append_messages(&self, messages: &[ChatMessage]) -> Result<()>;

    /// The last `limit` messages of a session in chronological order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_messages(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ChatMessage>>;

    // =========================================================================
    // Sequences
    // =========================================================================

    /// Atomically increment a named counter and return the new value (first call returns 1).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn next_sequence(&self, name: &str) -> Result<i64>;
}
