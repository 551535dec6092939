//! API handlers.

pub mod admin;
pub mod chat;
pub mod credits;
pub mod health;
pub mod payments;
pub mod quiz;
pub mod webhooks;
