//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, chat, credits, health, payments, quiz, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for metered AI endpoints.
/// Each one holds a reservation and an upstream AI call open.
const AI_MAX_CONCURRENT_REQUESTS: usize = 20;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
/// - `GET /v1/plans` - Plan catalogue
///
/// ## Credits (JWT auth)
/// - `GET /v1/credits/balance` - Get current balance
/// - `GET /v1/credits/transactions` - List transaction history
///
/// ## Payments (JWT auth)
/// - `POST /v1/payments` - Create a checkout for a plan
/// - `GET /v1/payments` - List recent payments
/// - `GET /v1/payments/:order_code` - Payment status
/// - `POST /v1/payments/:order_code/cancel` - Cancel a pending payment
///
/// ## Chat and quiz (JWT auth, metered)
/// - `POST /v1/chat/sessions` - Open a session
/// - `GET /v1/chat/sessions/:session_id` - Session history
/// - `POST /v1/chat/sessions/:session_id/messages` - Ask a question
/// - `POST /v1/quiz/generate` - Generate a quiz
///
/// ## Admin (Admin API key auth)
/// - `POST /v1/admin/credits/adjust` - Adjust a user's balances
/// - `GET /v1/admin/users/:user_id/balance` - Any user's balance
/// - `POST /v1/admin/payments/reconcile` - Run a reconcile pass
///
/// ## Webhooks (Signature verification)
/// - `POST /webhooks/payos` - PayOS payment webhooks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    // Build CORS layer
    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // AI-backed routes get their own, tighter limit so a slow provider cannot
    // starve balance and payment requests.
    let metered_routes = Router::new()
        .route("/chat/sessions/:session_id/messages", post(chat::ask))
        .route("/quiz/generate", post(quiz::generate_quiz))
        .layer(ConcurrencyLimitLayer::new(AI_MAX_CONCURRENT_REQUESTS));

    // Create concurrency-limited API routes
    let api_routes = Router::new()
        .route("/plans", get(payments::list_plans))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        // Payments
        .route(
            "/payments",
            get(payments::list_payments).post(payments::create_payment),
        )
        .route("/payments/:order_code", get(payments::get_payment))
        .route("/payments/:order_code/cancel", post(payments::cancel_payment))
        // Chat
        .route("/chat/sessions", post(chat::create_session))
        .route("/chat/sessions/:session_id", get(chat::history))
        // Admin
        .route("/admin/credits/adjust", post(admin::adjust_credits))
        .route("/admin/users/:user_id/balance", get(admin::get_user_balance))
        .route("/admin/payments/reconcile", post(admin::run_reconcile))
        .merge(metered_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by PayOS)
        .route("/webhooks/payos", post(webhooks::payos_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
