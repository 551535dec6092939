//! Idempotency guard for payment creation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use lexbill_core::{Payment, PaymentIdempotencyRecord, Result, UserId};
use lexbill_store::Store;

/// Longest client key accepted; longer keys are truncated.
const MAX_KEY_CHARS: usize = 128;

/// Result of checking a client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCheck {
    /// No live attempt under this key; go ahead and create a payment.
    Proceed,
    /// A payment already exists for this key.
    Existing(Payment),
}

/// Trim a raw header value; blank keys disable the guard.
#[must_use]
pub fn normalize_key(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| k.chars().take(MAX_KEY_CHARS).collect())
}

/// Deduplicates client retries of payment creation.
pub struct IdempotencyGuard {
    store: Arc<dyn Store>,
    ttl: chrono::Duration,
    key_locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl IdempotencyGuard {
    /// Create a guard whose records live for `ttl`.
    pub fn new(store: Arc<dyn Store>, ttl: chrono::Duration) -> Self {
        Self {
            store,
            ttl,
            key_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Serialize in-process requests carrying the same scoped key.
    pub async fn lock_key(&self, user_id: &UserId, client_key: &str) -> OwnedMutexGuard<()> {
        let scoped = PaymentIdempotencyRecord::scoped_key(user_id, client_key);
        let mutex = {
            let mut locks = self.key_locks.lock();
            Arc::clone(locks.entry(scoped).or_default())
        };
        mutex.lock_owned().await
    }

    /// Decide whether a request with this key may create a payment.
    pub fn check_key(
        &self,
        user_id: &UserId,
        client_key: &str,
        plan_code: &str,
        now: DateTime<Utc>,
    ) -> Result<KeyCheck> {
        let scoped = PaymentIdempotencyRecord::scoped_key(user_id, client_key);

        let Some(mut record) = self.store.get_idempotency_record(&scoped)? else {
            self.store.put_idempotency_record(&PaymentIdempotencyRecord::new(
                *user_id, client_key, plan_code, now, self.ttl,
            ))?;
            return Ok(KeyCheck::Proceed);
        };

        if record.is_expired(now) {
            self.store.delete_idempotency_record(&scoped)?;
            self.store.put_idempotency_record(&PaymentIdempotencyRecord::new(
                *user_id, client_key, plan_code, now, self.ttl,
            ))?;
            tracing::debug!(user_id = %user_id, "Expired idempotency record replaced");
            return Ok(KeyCheck::Proceed);
        }

        let Some(payment_id) = record.payment_id else {
            tracing::warn!(
                user_id = %user_id,
                "Idempotency record has no payment; previous attempt did not complete"
            );
            return Ok(KeyCheck::Proceed);
        };

        match self.store.get_payment(&payment_id)? {
            Some(payment) if !payment.status.is_terminal_failure() => {
                tracing::info!(
                    user_id = %user_id,
                    order_code = %payment.order_code,
                    status = %payment.status,
                    "Duplicate payment request, returning existing payment"
                );
                Ok(KeyCheck::Existing(payment))
            }
            linked => {
                if let Some(payment) = &linked {
                    tracing::info!(
                        user_id = %user_id,
                        order_code = %payment.order_code,
                        status = %payment.status,
                        "Previous payment under this key failed, allowing retry"
                    );
                }
                record.reset();
                record.plan_code = plan_code.to_string();
                self.store.put_idempotency_record(&record)?;
                Ok(KeyCheck::Proceed)
            }
        }
    }

    /// Link a payment to the key and mirror its status.
    pub fn attach_result(&self, user_id: &UserId, client_key: &str, payment: &Payment) -> Result<()> {
        let scoped = PaymentIdempotencyRecord::scoped_key(user_id, client_key);
        let mut record = match self.store.get_idempotency_record(&scoped)? {
            Some(record) => record,
            None => PaymentIdempotencyRecord::new(
                *user_id,
                client_key,
                payment.plan_code.as_str(),
                Utc::now(),
                self.ttl,
            ),
        };
        record.attach(payment.id, payment.status);
        self.store.put_idempotency_record(&record)?;
        Ok(())
    }

    /// Delete expired records and forget idle key locks.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.delete_expired_idempotency_records(now)?;
        self.key_locks
            .lock()
            .retain(|_, mutex| Arc::strong_count(mutex) > 1);
        if removed > 0 {
            tracing::info!(removed, "Expired idempotency records deleted");
        }
        Ok(removed)
    }
}
