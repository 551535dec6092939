//! Billing engine: ledger, reservations, payment settlement and metered AI work.

pub mod idempotency;
pub mod jobs;
pub mod ledger;
pub mod orchestrator;
pub mod order_code;
pub mod reservation;
pub mod settlement;

#[cfg(test)]
pub(crate) mod testing;

pub use idempotency::{normalize_key, IdempotencyGuard, KeyCheck};
pub use ledger::Ledger;
pub use orchestrator::{ChatAnswer, GeneratedQuiz, Orchestrator};
pub use order_code::OrderCodeGenerator;
pub use reservation::Reservations;
pub use settlement::{CheckoutResult, ReconcileReport, Settlement, WebhookOutcome};
