//! Service configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use lexbill_core::PlanCatalog;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to the `RocksDB` data directory (default: "/data/lexbill").
    pub data_dir: String,

    /// HS256 secret used to verify user bearer tokens.
    pub jwt_secret: String,

    /// Expected JWT audience, if any.
    pub jwt_audience: Option<String>,

    /// Admin API key for privileged endpoints.
    pub admin_api_key: Option<String>,

    /// PayOS credentials (optional).
    pub payos: Option<PayOsConfig>,

    /// AI provider settings (optional).
    pub ai: Option<AiConfig>,

    /// Frontend URL for checkout return/cancel redirects.
    pub frontend_url: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Billing tunables.
    pub billing: BillingConfig,

    /// Plan catalog.
    pub plans: PlanCatalog,
}

/// PayOS merchant credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct PayOsConfig {
    /// Merchant client id.
    pub client_id: String,
    /// API key.
    pub api_key: String,
    /// Checksum key used for request and webhook signatures.
    pub checksum_key: String,
    /// API base URL.
    #[serde(default = "default_payos_base_url")]
    pub base_url: String,
}

fn default_payos_base_url() -> String {
    "https://api-merchant.payos.vn".into()
}

/// OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer key.
    pub api_key: String,
    /// Model name.
    pub model: String,
}

/// Timing and sizing knobs for the billing engine.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// How long a reservation may stay ACTIVE before the sweeper releases it.
    /// Must exceed `ai_timeout`.
    pub reservation_ttl: Duration,
    /// Reservation sweep period.
    pub reservation_sweep_interval: Duration,
    /// Idempotency record lifetime.
    pub idempotency_ttl: Duration,
    /// Idempotency sweep period.
    pub idempotency_sweep_interval: Duration,
    /// Added to the order-code sequence value.
    pub order_code_base: i64,
    /// Gateway create-link attempts.
    pub gateway_max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub gateway_backoff_base: Duration,
    /// Webhook order lookup attempts.
    pub webhook_lookup_attempts: u32,
    /// Delay between webhook lookups.
    pub webhook_lookup_delay: Duration,
    /// Window in which a PENDING payment for the same plan is reused.
    pub payment_reuse_window: Duration,
    /// Reconciliation period.
    pub reconcile_interval: Duration,
    /// Minimum age of a PENDING payment before reconciliation looks at it.
    pub reconcile_min_age: Duration,
    /// Reconciliation batch size.
    pub reconcile_batch: usize,
    /// Age after which an open PENDING payment is expired.
    pub payment_expire_after: Duration,
    /// Credit retry period.
    pub credit_retry_interval: Duration,
    /// Credit attempts before NEEDS_REVIEW.
    pub credit_retry_max_attempts: u32,
    /// Credit retry batch size.
    pub credit_retry_batch: usize,
    /// Purge period.
    pub purge_interval: Duration,
    /// Terminal failed payments older than this are deleted.
    pub purge_retention: Duration,
    /// Maximum user questions per chat session.
    pub question_limit: u32,
    /// Phase A attempts on version conflicts.
    pub charge_max_attempts: u32,
    /// Phase A backoff unit, multiplied by the attempt number.
    pub charge_backoff: Duration,
    /// AI call deadline.
    pub ai_timeout: Duration,
    /// Messages of history sent to the AI provider.
    pub history_limit: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(5 * 60),
            reservation_sweep_interval: Duration::from_secs(60),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            idempotency_sweep_interval: Duration::from_secs(3600),
            order_code_base: 100_000,
            gateway_max_attempts: 3,
            gateway_backoff_base: Duration::from_millis(500),
            webhook_lookup_attempts: 3,
            webhook_lookup_delay: Duration::from_millis(200),
            payment_reuse_window: Duration::from_secs(10 * 60),
            reconcile_interval: Duration::from_secs(5 * 60),
            reconcile_min_age: Duration::from_secs(30 * 60),
            reconcile_batch: 50,
            payment_expire_after: Duration::from_secs(24 * 3600),
            credit_retry_interval: Duration::from_secs(2 * 60),
            credit_retry_max_attempts: 5,
            credit_retry_batch: 10,
            purge_interval: Duration::from_secs(24 * 3600),
            purge_retention: Duration::from_secs(90 * 24 * 3600),
            question_limit: 10,
            charge_max_attempts: 3,
            charge_backoff: Duration::from_millis(50),
            ai_timeout: Duration::from_secs(60),
            history_limit: 10,
        }
    }
}

/// Convert a std duration into a chrono one, saturating.
#[must_use]
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // Try to load PayOS secrets from file first, then fall back to env vars
        let payos = load_payos_secrets();

        let ai = std::env::var("AI_API_KEY").ok().map(|api_key| AiConfig {
            base_url: std::env::var("AI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key,
            model: std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        });

        let mut billing = BillingConfig::default();
        if let Some(secs) = env_parse::<u64>("AI_TIMEOUT_SECONDS") {
            billing.ai_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("RESERVATION_TTL_SECONDS") {
            billing.reservation_ttl = Duration::from_secs(secs);
        }
        if let Some(limit) = env_parse("CHAT_QUESTION_LIMIT") {
            billing.question_limit = limit;
        }
        if let Some(base) = env_parse("ORDER_CODE_BASE") {
            billing.order_code_base = base;
        }
        if billing.reservation_ttl <= billing.ai_timeout {
            tracing::warn!(
                reservation_ttl_secs = billing.reservation_ttl.as_secs(),
                ai_timeout_secs = billing.ai_timeout.as_secs(),
                "Reservation TTL does not exceed the AI timeout; in-flight charges may be swept"
            );
        }

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_audience: std::env::var("JWT_AUDIENCE").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            payos,
            ai,
            frontend_url: std::env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(1024 * 1024), // 1MB
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS").unwrap_or(90),
            billing,
            plans: PlanCatalog::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Load PayOS secrets from file or environment.
fn load_payos_secrets() -> Option<PayOsConfig> {
    let secret_paths = [
        ".secrets/payos.json",
        "lexbill/.secrets/payos.json",
        "../.secrets/payos.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<PayOsConfig>(path) {
            tracing::info!(path = %path, "Loaded PayOS secrets from file");
            return Some(secrets);
        }
    }

    // Fall back to environment variables
    tracing::debug!("PayOS secrets file not found, using environment variables");
    let client_id = std::env::var("PAYOS_CLIENT_ID").ok()?;
    let api_key = std::env::var("PAYOS_API_KEY").ok()?;
    let checksum_key = std::env::var("PAYOS_CHECKSUM_KEY").ok()?;
    Some(PayOsConfig {
        client_id,
        api_key,
        checksum_key,
        base_url: std::env::var("PAYOS_BASE_URL").unwrap_or_else(|_| default_payos_base_url()),
    })
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/lexbill".into(),
            jwt_secret: "change-me".into(),
            jwt_audience: None,
            admin_api_key: None,
            payos: None,
            ai: None,
            frontend_url: "http://localhost:3000".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 90,
            billing: BillingConfig::default(),
            plans: PlanCatalog::default(),
        }
    }
}
