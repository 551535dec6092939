//! Application state.

use std::sync::Arc;

use lexbill_store::Store;

use crate::ai::{AiProvider, OpenAiClient};
use crate::billing::{IdempotencyGuard, Ledger, Orchestrator, Reservations, Settlement};
use crate::config::{chrono_duration, ServiceConfig};
use crate::error::ApiError;
use crate::notify::TracingNotifier;
use crate::payos::{PayOsClient, PaymentGateway};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Credit ledger.
    pub ledger: Arc<Ledger>,

    /// Credit reservations.
    pub reservations: Arc<Reservations>,

    /// Payment idempotency guard.
    pub idempotency: Arc<IdempotencyGuard>,

    /// Payment settlement (only when PayOS is configured).
    pub settlement: Option<Arc<Settlement>>,

    /// Metered AI work (only when an AI provider is configured).
    pub orchestrator: Option<Arc<Orchestrator>>,
}

impl AppState {
    /// Create a new application state, building external clients from config.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let gateway = config.payos.as_ref().and_then(|payos| match PayOsClient::new(payos) {
            Ok(client) => {
                tracing::info!(base_url = %payos.base_url, "PayOS integration enabled");
                Some(Arc::new(client) as Arc<dyn PaymentGateway>)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to create PayOS client");
                None
            }
        });

        if gateway.is_none() {
            tracing::warn!("PayOS not configured - payments will not be available");
        }

        let ai = config.ai.as_ref().and_then(|ai| {
            match OpenAiClient::new(ai, config.billing.ai_timeout) {
                Ok(client) => {
                    tracing::info!(model = %ai.model, "AI provider enabled");
                    Some(Arc::new(client) as Arc<dyn AiProvider>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create AI client");
                    None
                }
            }
        });

        if ai.is_none() {
            tracing::warn!("AI provider not configured - chat and quiz generation will not be available");
        }

        Self::with_providers(store, config, gateway, ai)
    }

    /// Create a state with explicit gateway and AI implementations.
    #[must_use]
    pub fn with_providers(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        gateway: Option<Arc<dyn PaymentGateway>>,
        ai: Option<Arc<dyn AiProvider>>,
    ) -> Self {
        let notifier = Arc::new(TracingNotifier);
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), notifier.clone()));
        let reservations = Arc::new(Reservations::new(
            Arc::clone(&store),
            chrono_duration(config.billing.reservation_ttl),
        ));
        let idempotency = Arc::new(IdempotencyGuard::new(
            Arc::clone(&store),
            chrono_duration(config.billing.idempotency_ttl),
        ));

        let settlement = gateway.map(|gateway| {
            Arc::new(Settlement::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&idempotency),
                gateway,
                notifier,
                &config,
            ))
        });
        let orchestrator = ai.map(|ai| {
            Arc::new(Orchestrator::new(
                Arc::clone(&store),
                Arc::clone(&reservations),
                ai,
                config.billing.clone(),
            ))
        });

        Self {
            store,
            config,
            ledger,
            reservations,
            idempotency,
            settlement,
            orchestrator,
        }
    }

    /// Payment settlement, or 503 if PayOS is not configured.
    pub fn settlement(&self) -> Result<&Settlement, ApiError> {
        self.settlement
            .as_deref()
            .ok_or_else(|| ApiError::Unavailable("payments are not configured".into()))
    }

    /// The orchestrator, or 503 if no AI provider is configured.
    pub fn orchestrator(&self) -> Result<&Orchestrator, ApiError> {
        self.orchestrator
            .as_deref()
            .ok_or_else(|| ApiError::Unavailable("AI provider is not configured".into()))
    }

    /// Check if payments are available.
    #[must_use]
    pub fn has_payments(&self) -> bool {
        self.settlement.is_some()
    }

    /// Check if an AI provider is available.
    #[must_use]
    pub fn has_ai(&self) -> bool {
        self.orchestrator.is_some()
    }
}
