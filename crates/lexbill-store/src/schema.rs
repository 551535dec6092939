//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Balance rows, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Ledger entries, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Reservations, keyed by `reservation_id`.
    pub const RESERVATIONS: &str = "reservations";

    /// Index: ACTIVE reservation per work unit. Value is the reservation id.
    pub const ACTIVE_RESERVATIONS: &str = "active_reservations";

    /// Payments, keyed by `payment_id`.
    pub const PAYMENTS: &str = "payments";

    /// Index: order code (big-endian) to payment id.
    pub const PAYMENTS_BY_ORDER: &str = "payments_by_order";

    /// Index: `user_id || created_millis || payment_id`. Value is empty.
    pub const PAYMENTS_BY_USER: &str = "payments_by_user";

    /// Index: `status || 0x00 || created_millis || payment_id`. Value is empty.
    pub const PAYMENTS_BY_STATUS: &str = "payments_by_status";

    /// Idempotency records, keyed by scoped key.
    pub const IDEMPOTENCY: &str = "idempotency";

    /// Chat sessions, keyed by `session_id`.
    pub const SESSIONS: &str = "sessions";

    /// Chat messages, keyed by `session_id || created_millis || message_id`.
    pub const MESSAGES: &str = "messages";

    /// Named counters, value is a big-endian `i64`.
    pub const SEQUENCES: &str = "sequences";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::RESERVATIONS,
        cf::ACTIVE_RESERVATIONS,
        cf::PAYMENTS,
        cf::PAYMENTS_BY_ORDER,
        cf::PAYMENTS_BY_USER,
        cf::PAYMENTS_BY_STATUS,
        cf::IDEMPOTENCY,
        cf::SESSIONS,
        cf::MESSAGES,
        cf::SEQUENCES,
    ]
}
