//! lexbill HTTP API service and billing engine.
//!
//! This crate wires the credit ledger, reservations, payment settlement and the
//! chat billing saga to an HTTP surface:
//!
//! - Credit balance and transaction history
//! - Payment creation, cancellation and history (PayOS checkout links)
//! - Metered chat sessions and quiz generation (AI provider)
//! - Admin balance adjustments
//! - PayOS webhooks
//!
//! # Authentication
//!
//! 1. **HS256 JWT bearer tokens** - end-user requests, `sub` is the user ID
//! 2. **Admin API key** - `x-admin-key` header for privileged endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Webhook handlers need async for consistency

pub mod ai;
pub mod auth;
pub mod billing;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod payos;
pub mod routes;
pub mod state;

pub use ai::{AiError, AiProvider, OpenAiClient};
pub use config::{BillingConfig, ServiceConfig};
pub use error::ApiError;
pub use payos::{GatewayError, PayOsClient, PaymentGateway};
pub use routes::create_router;
pub use state::AppState;
