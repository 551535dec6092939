//! Core types and utilities for lexbill.
//!
//! This crate provides the foundational types shared by the store and the service:
//!
//! - **Identifiers**: `UserId`, `TransactionId`, `ReservationId`, `PaymentId`, `SessionId`, `OrderCode`
//! - **Balances**: `UserCreditBalance`, `BalanceSnapshot`, `CreditType`
//! - **Ledger**: `CreditTransaction`, `TransactionType`
//! - **Reservations**: `CreditReservation`, `ReservationState`
//! - **Payments**: `Payment`, `PaymentStatus`, `PaymentIdempotencyRecord`
//! - **Chat billing**: `ChatSession`, `ChargeState`, `ChatMessage`
//! - **Plans**: `Plan`, `PlanCatalog`
//!
//! # Credit Unit
//!
//! One credit pays for one AI-backed operation. Users hold two independent
//! balances: chat credits (one per chat session) and quiz-generation credits
//! (one per generation). Balances are unsigned integers and can never go negative.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod error;
pub mod idempotency;
pub mod ids;
pub mod payment;
pub mod plan;
pub mod reservation;
pub mod session;
pub mod transaction;

pub use balance::{
    BalanceSnapshot, CreditType, PlanLabel, UserCreditBalance, WELCOME_BONUS_CHAT_CREDITS,
};
pub use error::{BillingError, Result};
pub use idempotency::{IdempotencyStatus, PaymentIdempotencyRecord};
pub use ids::{
    IdError, MessageId, OrderCode, PaymentId, ReservationId, SessionId, TransactionId, UserId,
};
pub use payment::{Payment, PaymentStatus, GATEWAY_SUCCESS_CODE};
pub use plan::{Plan, PlanCatalog};
pub use reservation::{CreditReservation, ReservationState};
pub use session::{ChargeState, ChatMessage, ChatSession, MessageRole};
pub use transaction::{CreditTransaction, TransactionType};
