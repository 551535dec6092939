//! Order code generation.

use std::sync::Arc;

use lexbill_core::{BillingError, OrderCode, Result};
use lexbill_store::Store;

/// Name of the persisted sequence backing order codes.
pub const ORDER_CODE_SEQUENCE: &str = "order_code";

/// Issues order codes from the store's shared counter.
pub struct OrderCodeGenerator {
    store: Arc<dyn Store>,
    base: i64,
}

impl OrderCodeGenerator {
    /// Create a generator that offsets the sequence by `base`.
    pub fn new(store: Arc<dyn Store>, base: i64) -> Self {
        Self { store, base }
    }

    /// Next unique order code.
    pub fn next(&self) -> Result<OrderCode> {
        let value = self.store.next_sequence(ORDER_CODE_SEQUENCE)?;
        let code = self
            .base
            .checked_add(value)
            .ok_or_else(|| BillingError::Configuration("order code sequence exhausted".into()))?;
        Ok(OrderCode::new(code)?)
    }
}
