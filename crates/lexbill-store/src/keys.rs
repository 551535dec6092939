//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.
//! Timestamps are encoded as sign-flipped big-endian milliseconds so that byte
//! order matches time order.

use chrono::{DateTime, Utc};
use lexbill_core::{
    OrderCode, PaymentId, PaymentStatus, ReservationId, SessionId, TransactionId, UserId,
};

use crate::error::{Result, StoreError};

const SIGN_BIT: u64 = 1 << 63;

fn time_bytes(at: DateTime<Utc>) -> [u8; 8] {
    let millis = u64::from_be_bytes(at.timestamp_millis().to_be_bytes());
    (millis ^ SIGN_BIT).to_be_bytes()
}

fn tail16(key: &[u8]) -> Result<[u8; 16]> {
    key.len()
        .checked_sub(16)
        .and_then(|start| key[start..].try_into().ok())
        .ok_or_else(|| StoreError::Database(format!("malformed index key of {} bytes", key.len())))
}

/// Create a balance key from a user ID.
#[must_use]
pub fn balance_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
///
/// Since ULIDs are time-ordered, transactions for a user will be sorted by time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Create a prefix for iterating everything indexed under a user.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the transaction ID from a user-transaction index key.
///
/// # Errors
///
/// Returns `StoreError::Database` if the key is shorter than 16 bytes.
pub fn extract_transaction_id(key: &[u8]) -> Result<TransactionId> {
    Ok(TransactionId::from_bytes(tail16(key)?))
}

/// Create a reservation key.
#[must_use]
pub fn reservation_key(id: &ReservationId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Decode a reservation ID stored as an index value.
///
/// # Errors
///
/// Returns `StoreError::Database` if the value is not 16 bytes.
pub fn decode_reservation_id(value: &[u8]) -> Result<ReservationId> {
    Ok(ReservationId::from_uuid(uuid_from(value)?))
}

/// Create a payment key.
#[must_use]
pub fn payment_key(id: &PaymentId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create an order-code index key.
#[must_use]
pub fn order_code_key(order_code: OrderCode) -> Vec<u8> {
    order_code.value().to_be_bytes().to_vec()
}

/// Create a user-payment index key: `user_id || created || payment_id`.
#[must_use]
pub fn user_payment_key(user_id: &UserId, created_at: DateTime<Utc>, id: &PaymentId) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&time_bytes(created_at));
    key.extend_from_slice(id.as_bytes());
    key
}

/// Prefix of all status-index keys for one status.
#[must_use]
pub fn status_prefix(status: PaymentStatus) -> Vec<u8> {
    let mut key = status.as_str().as_bytes().to_vec();
    key.push(0);
    key
}

/// Create a status index key: `status || 0x00 || created || payment_id`.
#[must_use]
pub fn status_payment_key(status: PaymentStatus, created_at: DateTime<Utc>, id: &PaymentId) -> Vec<u8> {
    let mut key = status_prefix(status);
    key.extend_from_slice(&time_bytes(created_at));
    key.extend_from_slice(id.as_bytes());
    key
}

/// Extract the payment ID from the tail of an index key or from an index value.
///
/// # Errors
///
/// Returns `StoreError::Database` if fewer than 16 bytes are present.
pub fn extract_payment_id(key: &[u8]) -> Result<PaymentId> {
    Ok(PaymentId::from_uuid(uuid_from(&tail16(key)?)?))
}

/// Create a session key.
#[must_use]
pub fn session_key(id: &SessionId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create a message key: `session_id || created || message_id`.
#[must_use]
pub fn message_key(session_id: &SessionId, created_at: DateTime<Utc>, message_id: &[u8; 16]) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(session_id.as_bytes());
    key.extend_from_slice(&time_bytes(created_at));
    key.extend_from_slice(message_id);
    key
}

fn uuid_from(bytes: &[u8]) -> Result<uuid::Uuid> {
    uuid::Uuid::from_slice(bytes).map_err(|e| StoreError::Database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn user_transaction_key_format() {
        let user_id = UserId::generate();
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user_id, &tx_id);

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], user_id.as_bytes());
        assert_eq!(extract_transaction_id(&key).unwrap(), tx_id);
    }

    #[test]
    fn status_keys_sort_by_creation_time() {
        let id = PaymentId::generate();
        let now = Utc::now();
        let older = status_payment_key(PaymentStatus::Pending, now - Duration::hours(1), &id);
        let newer = status_payment_key(PaymentStatus::Pending, now, &id);
        assert!(older < newer);
        assert!(older.starts_with(&status_prefix(PaymentStatus::Pending)));
        assert_eq!(extract_payment_id(&newer).unwrap(), id);
    }

    #[test]
    fn status_prefixes_do_not_overlap() {
        let paid = status_prefix(PaymentStatus::Paid);
        let credit_failed = status_prefix(PaymentStatus::PaidCreditFailed);
        assert!(!credit_failed.starts_with(&paid));
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(extract_payment_id(&[1, 2, 3]).is_err());
    }
}
