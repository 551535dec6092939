//! Payment settlement: checkout creation, webhooks, reconciliation and credit retry.
//!
//! Every status change is a compare-and-set against the status the caller last
//! read, so a webhook, the reconcile job and a user cancel racing on the same
//! payment cannot overwrite each other. Money received always wins: a verified
//! success webhook moves a payment to PAID from any non-success status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use lexbill_core::{
    BillingError, OrderCode, Payment, PaymentId, PaymentStatus, Plan, PlanCatalog, Result, UserId,
    GATEWAY_SUCCESS_CODE,
};
use lexbill_store::Store;

use super::idempotency::{normalize_key, IdempotencyGuard, KeyCheck};
use super::ledger::Ledger;
use super::order_code::OrderCodeGenerator;
use crate::config::{chrono_duration, BillingConfig, ServiceConfig};
use crate::notify::Notifier;
use crate::payos::{
    CheckoutLink, CreatePaymentLink, GatewayError, GatewayPaymentStatus, PaymentGateway,
    WebhookData, WebhookPayload,
};

/// Recent payments scanned when looking for a reusable checkout link.
const RECENT_PAYMENTS_SCAN: usize = 20;

/// Payments returned by the history endpoint.
const PAYMENT_HISTORY_LIMIT: usize = 50;

/// Attempts at a status compare-and-set before giving up.
const CAS_ATTEMPTS: usize = 3;

/// Rows removed per status per purge run.
const PURGE_BATCH: usize = 500;

/// A PAID payment older than this without credits is picked up by the retry job.
const STUCK_PAID_AFTER_MINUTES: i64 = 5;

/// Result of [`Settlement::create_payment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutResult {
    /// The payment the caller should pay.
    pub payment: Payment,
    /// Whether an existing payment was returned instead of a new one.
    pub reused: bool,
}

/// What a webhook delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Signature did not verify.
    Rejected,
    /// Nothing to do, or the payload could not be used.
    Ignored,
    /// No payment has this order code.
    UnknownOrder,
    /// Another delivery already claimed this payment.
    Duplicate,
    /// Money was already recorded for this payment.
    AlreadySettled,
    /// The paid amount differs from the order; parked for review.
    AmountMismatch,
    /// Marked PAID and credited.
    Credited,
    /// Marked PAID but the credit grant failed; the retry job takes over.
    CreditFailed,
    /// The gateway reported a failed transfer.
    MarkedFailed,
}

/// Counts from one reconcile run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Stale PENDING payments looked up.
    pub checked: usize,
    /// Moved to EXPIRED.
    pub expired: usize,
    /// Paid at the gateway without a webhook; moved to NEEDS_REVIEW.
    pub needs_review: usize,
}

/// Drives payments through their lifecycle.
pub struct Settlement {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    idempotency: Arc<IdempotencyGuard>,
    order_codes: OrderCodeGenerator,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    plans: PlanCatalog,
    config: BillingConfig,
    return_url: String,
    cancel_url: String,
}

impl Settlement {
    /// Build the engine from shared components and service configuration.
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        idempotency: Arc<IdempotencyGuard>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: &ServiceConfig,
    ) -> Self {
        let frontend = config.frontend_url.trim_end_matches('/');
        Self {
            order_codes: OrderCodeGenerator::new(Arc::clone(&store), config.billing.order_code_base),
            store,
            ledger,
            idempotency,
            gateway,
            notifier,
            plans: config.plans.clone(),
            config: config.billing.clone(),
            return_url: format!("{frontend}/payment/success"),
            cancel_url: format!("{frontend}/payment/cancel"),
        }
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Create (or reuse) a checkout for `plan_code`.
    ///
    /// With a client key, retries of the same request return the payment the
    /// first one created. Without one, a recent PENDING payment for the same
    /// plan is reused if the gateway confirms its link is still open.
    pub async fn create_payment(
        &self,
        user_id: &UserId,
        plan_code: &str,
        client_key: Option<&str>,
    ) -> Result<CheckoutResult> {
        let plan = self.plans.purchasable(plan_code)?.clone();
        let key = normalize_key(client_key);

        let _key_guard = match &key {
            Some(k) => Some(self.idempotency.lock_key(user_id, k).await),
            None => None,
        };

        if let Some(k) = &key {
            if let KeyCheck::Existing(payment) =
                self.idempotency.check_key(user_id, k, &plan.code, Utc::now())?
            {
                return Ok(CheckoutResult {
                    payment,
                    reused: true,
                });
            }
        }

        if let Some(payment) = self.reusable_pending(user_id, &plan).await? {
            if let Some(k) = &key {
                self.idempotency.attach_result(user_id, k, &payment)?;
            }
            return Ok(CheckoutResult {
                payment,
                reused: true,
            });
        }

        let payment = self.open_payment(user_id, &plan, key.as_deref()).await?;
        Ok(CheckoutResult {
            payment,
            reused: false,
        })
    }

    async fn reusable_pending(&self, user_id: &UserId, plan: &Plan) -> Result<Option<Payment>> {
        let now = Utc::now();
        let window = chrono_duration(self.config.payment_reuse_window);
        let Some(candidate) = self
            .store
            .list_payments_by_user(user_id, RECENT_PAYMENTS_SCAN)?
            .into_iter()
            .find(|p| {
                p.status == PaymentStatus::Pending
                    && p.plan_code == plan.code
                    && now - p.created_at < window
            })
        else {
            return Ok(None);
        };

        match self.gateway.get_payment_status(candidate.order_code).await {
            Ok(info) if info.status.is_open() && candidate.checkout_url.is_some() => {
                tracing::info!(
                    user_id = %user_id,
                    order_code = %candidate.order_code,
                    "Reusing open checkout link"
                );
                Ok(Some(candidate))
            }
            Ok(info) if info.status == GatewayPaymentStatus::Paid => {
                // Settled by the pending webhook or the reconcile job.
                tracing::warn!(
                    order_code = %candidate.order_code,
                    "Pending payment already paid at gateway; opening a new one"
                );
                Ok(None)
            }
            Ok(info) => {
                self.expire(&candidate, &format!("gateway reports {:?}", info.status), now)?;
                Ok(None)
            }
            Err(GatewayError::NotFound) => {
                self.expire(&candidate, "not found at gateway", now)?;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    order_code = %candidate.order_code,
                    error = %e,
                    "Cannot verify pending payment"
                );
                Err(BillingError::PendingPaymentExists {
                    order_code: candidate.order_code.value(),
                })
            }
        }
    }

    async fn open_payment(
        &self,
        user_id: &UserId,
        plan: &Plan,
        client_key: Option<&str>,
    ) -> Result<Payment> {
        let order_code = self.order_codes.next()?;
        let mut payment = Payment::new(*user_id, plan.code.as_str(), plan.price, order_code, Utc::now());
        self.store.insert_payment(&payment)?;
        if let Some(k) = client_key {
            self.idempotency.attach_result(user_id, k, &payment)?;
        }

        tracing::info!(
            user_id = %user_id,
            order_code = %order_code,
            plan_code = %plan.code,
            amount = plan.price,
            "Payment created"
        );

        let request = CreatePaymentLink {
            order_code: order_code.value(),
            amount: plan.price,
            description: format!("Don hang {order_code}"),
            return_url: self.return_url.clone(),
            cancel_url: self.cancel_url.clone(),
        };

        match self.create_link_with_retry(&request).await {
            Ok(link) => {
                payment.checkout_url = Some(link.checkout_url);
                payment.qr_code = link.qr_code;
                payment.updated_at = Utc::now();
                if self
                    .store
                    .update_payment_if_status(&payment, PaymentStatus::Pending)?
                {
                    return Ok(payment);
                }
                // A webhook got there first.
                self.store
                    .get_payment(&payment.id)?
                    .ok_or_else(|| BillingError::not_found("payment", payment.id))
            }
            Err(e) => {
                tracing::error!(order_code = %order_code, error = %e, "Checkout link creation failed");
                payment.fail_with(PaymentStatus::Failed, e.to_string(), Utc::now())?;
                if self
                    .store
                    .update_payment_if_status(&payment, PaymentStatus::Pending)?
                {
                    if let Some(k) = client_key {
                        self.idempotency.attach_result(user_id, k, &payment)?;
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn create_link_with_retry(
        &self,
        request: &CreatePaymentLink,
    ) -> std::result::Result<CheckoutLink, GatewayError> {
        let attempts = self.config.gateway_max_attempts.max(1);
        let mut delay = self.config.gateway_backoff_base;
        let mut attempt = 1;
        loop {
            match self.gateway.create_payment_link(request).await {
                Ok(link) => return Ok(link),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        order_code = request.order_code,
                        attempt,
                        error = %e,
                        "Checkout link creation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel a PENDING payment owned by `user_id`.
    pub async fn cancel_payment(&self, user_id: &UserId, order_code: OrderCode) -> Result<Payment> {
        let payment = self.owned_payment(user_id, order_code)?;
        if payment.status != PaymentStatus::Pending {
            return Err(BillingError::InvalidPaymentTransition {
                from: payment.status,
                to: PaymentStatus::Cancelled,
            });
        }

        match self
            .gateway
            .cancel_payment_link(order_code, "Cancelled by user")
            .await
        {
            Ok(()) | Err(GatewayError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let mut cancelled = payment;
        cancelled.fail_with(PaymentStatus::Cancelled, "Cancelled by user", Utc::now())?;
        if !self
            .store
            .update_payment_if_status(&cancelled, PaymentStatus::Pending)?
        {
            let current = self.owned_payment(user_id, order_code)?;
            return Err(BillingError::InvalidPaymentTransition {
                from: current.status,
                to: PaymentStatus::Cancelled,
            });
        }

        tracing::info!(user_id = %user_id, order_code = %order_code, "Payment cancelled");
        Ok(cancelled)
    }

    /// A payment owned by `user_id`.
    pub fn get_payment(&self, user_id: &UserId, order_code: OrderCode) -> Result<Payment> {
        self.owned_payment(user_id, order_code)
    }

    /// Recent payments, newest first.
    pub fn list_payments(&self, user_id: &UserId) -> Result<Vec<Payment>> {
        Ok(self
            .store
            .list_payments_by_user(user_id, PAYMENT_HISTORY_LIMIT)?)
    }

    fn owned_payment(&self, user_id: &UserId, order_code: OrderCode) -> Result<Payment> {
        let payment = self
            .store
            .get_payment_by_order_code(order_code)?
            .ok_or_else(|| BillingError::not_found("payment", order_code))?;
        if payment.user_id != *user_id {
            return Err(BillingError::Forbidden(
                "payment belongs to another user".into(),
            ));
        }
        Ok(payment)
    }

    fn expire(&self, payment: &Payment, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut expired = payment.clone();
        expired.fail_with(PaymentStatus::Expired, reason, now)?;
        let updated = self
            .store
            .update_payment_if_status(&expired, PaymentStatus::Pending)?;
        if updated {
            tracing::info!(order_code = %payment.order_code, reason, "Payment expired");
        }
        Ok(updated)
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Apply one gateway webhook delivery. Never fails; the outcome is logged.
    pub async fn handle_webhook(&self, payload: &WebhookPayload) -> WebhookOutcome {
        let data = match self.gateway.verify_webhook(payload) {
            Ok(data) => data,
            Err(GatewayError::InvalidSignature) => {
                tracing::warn!("Webhook signature verification failed");
                return WebhookOutcome::Rejected;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Webhook payload unusable");
                return WebhookOutcome::Ignored;
            }
        };

        let outcome = match self.process_webhook(&data).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(order_code = data.order_code, error = %e, "Webhook processing failed");
                WebhookOutcome::Ignored
            }
        };
        tracing::info!(order_code = data.order_code, code = %data.code, outcome = ?outcome, "Webhook processed");
        outcome
    }

    async fn process_webhook(&self, data: &WebhookData) -> Result<WebhookOutcome> {
        let order_code = OrderCode::new(data.order_code)?;
        let Some(payment) = self.find_with_retry(order_code).await? else {
            tracing::warn!(order_code = %order_code, "Webhook for unknown order");
            return Ok(WebhookOutcome::UnknownOrder);
        };

        if data.code != GATEWAY_SUCCESS_CODE {
            return self.record_gateway_failure(payment, data);
        }

        if !self.store.claim_webhook(order_code)? {
            tracing::info!(order_code = %order_code, "Webhook already claimed by an earlier delivery");
            return Ok(WebhookOutcome::Duplicate);
        }
        self.settle_success(order_code, data)
    }

    /// The webhook can race payment insertion; poll briefly before giving up.
    async fn find_with_retry(&self, order_code: OrderCode) -> Result<Option<Payment>> {
        let attempts = self.config.webhook_lookup_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(payment) = self.store.get_payment_by_order_code(order_code)? {
                return Ok(Some(payment));
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.webhook_lookup_delay).await;
            }
        }
        Ok(None)
    }

    fn settle_success(&self, order_code: OrderCode, data: &WebhookData) -> Result<WebhookOutcome> {
        for _ in 0..CAS_ATTEMPTS {
            let mut payment = self
                .store
                .get_payment_by_order_code(order_code)?
                .ok_or_else(|| BillingError::not_found("payment", order_code))?;
            let expected = payment.status;
            if expected.is_success() {
                tracing::info!(order_code = %order_code, status = %expected, "Payment already settled");
                return Ok(WebhookOutcome::AlreadySettled);
            }

            let now = Utc::now();
            if data.amount != payment.amount {
                if expected == PaymentStatus::NeedsReview {
                    return Ok(WebhookOutcome::AmountMismatch);
                }
                payment.fail_with(
                    PaymentStatus::NeedsReview,
                    format!("paid {} but order amount is {}", data.amount, payment.amount),
                    now,
                )?;
                if self.store.update_payment_if_status(&payment, expected)? {
                    tracing::error!(
                        order_code = %order_code,
                        paid = data.amount,
                        expected = payment.amount,
                        "Paid amount mismatch, payment needs review"
                    );
                    return Ok(WebhookOutcome::AmountMismatch);
                }
                continue;
            }

            if expected != PaymentStatus::Pending {
                tracing::warn!(
                    order_code = %order_code,
                    status = %expected,
                    "Success webhook for a closed payment; recording the money"
                );
            }
            payment.transition(PaymentStatus::Paid, now)?;
            payment.paid_at = Some(now);
            payment.gateway_transaction_id.clone_from(&data.reference);
            if self.store.update_payment_if_status(&payment, expected)? {
                tracing::info!(order_code = %order_code, user_id = %payment.user_id, "Payment marked PAID");
                return Ok(if self.credit(&payment) {
                    WebhookOutcome::Credited
                } else {
                    WebhookOutcome::CreditFailed
                });
            }
        }
        Err(BillingError::ConcurrentModification(format!(
            "payment {order_code} kept changing while settling"
        )))
    }

    fn record_gateway_failure(&self, payment: Payment, data: &WebhookData) -> Result<WebhookOutcome> {
        if payment.status != PaymentStatus::Pending {
            tracing::info!(
                order_code = %payment.order_code,
                status = %payment.status,
                "Failure webhook for a non-pending payment ignored"
            );
            return Ok(if payment.status.is_success() {
                WebhookOutcome::AlreadySettled
            } else {
                WebhookOutcome::Ignored
            });
        }

        let reason = data
            .desc
            .clone()
            .unwrap_or_else(|| format!("gateway code {}", data.code));
        let mut failed = payment;
        failed.fail_with(PaymentStatus::Failed, reason, Utc::now())?;
        if self
            .store
            .update_payment_if_status(&failed, PaymentStatus::Pending)?
        {
            tracing::info!(order_code = %failed.order_code, code = %data.code, "Payment marked FAILED");
            Ok(WebhookOutcome::MarkedFailed)
        } else {
            Ok(WebhookOutcome::Ignored)
        }
    }

    // =========================================================================
    // Crediting
    // =========================================================================

    /// Grant a paid payment's credits. Returns whether it ended CREDITED.
    fn credit(&self, payment: &Payment) -> bool {
        let result = self
            .plans
            .get(&payment.plan_code)
            .ok_or_else(|| BillingError::Configuration(format!("unknown plan {}", payment.plan_code)))
            .and_then(|plan| self.ledger.credit_payment(&payment.id, plan));

        match result {
            Ok(credited) => {
                self.notifier
                    .credits_granted(&credited.user_id, credited.order_code, &credited.plan_code);
                true
            }
            Err(e) => {
                let err = BillingError::CreditGrantFailureAfterPayment {
                    order_code: payment.order_code.value(),
                    reason: e.to_string(),
                };
                tracing::error!(user_id = %payment.user_id, error = %err, "Credit grant failed after payment");
                if let Err(e) = self.record_credit_failure(&payment.id, &err.to_string()) {
                    tracing::error!(
                        order_code = %payment.order_code,
                        error = %e,
                        "Could not record credit failure"
                    );
                }
                false
            }
        }
    }

    fn record_credit_failure(&self, id: &PaymentId, reason: &str) -> Result<PaymentStatus> {
        for _ in 0..CAS_ATTEMPTS {
            let mut payment = self
                .store
                .get_payment(id)?
                .ok_or_else(|| BillingError::not_found("payment", id))?;
            let expected = payment.status;
            if !matches!(expected, PaymentStatus::Paid | PaymentStatus::PaidCreditFailed) {
                return Ok(expected);
            }

            let now = Utc::now();
            payment.credit_retry_count += 1;
            if expected == PaymentStatus::Paid {
                payment.fail_with(PaymentStatus::PaidCreditFailed, reason, now)?;
            } else {
                payment.failure_reason = Some(reason.to_string());
                payment.updated_at = now;
            }
            if payment.credit_retry_count >= self.config.credit_retry_max_attempts {
                payment.fail_with(PaymentStatus::NeedsReview, reason, now)?;
                tracing::error!(
                    order_code = %payment.order_code,
                    attempts = payment.credit_retry_count,
                    "Credit retries exhausted, payment needs review"
                );
            }
            if self.store.update_payment_if_status(&payment, expected)? {
                return Ok(payment.status);
            }
        }
        Err(BillingError::ConcurrentModification(format!(
            "payment {id} kept changing while recording credit failure"
        )))
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Resolve stale PENDING payments against the gateway.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let cutoff = now - chrono_duration(self.config.reconcile_min_age);
        let expire_after = chrono_duration(self.config.payment_expire_after);
        let stale = self.store.list_payments_by_status(
            PaymentStatus::Pending,
            cutoff,
            self.config.reconcile_batch,
        )?;

        let mut report = ReconcileReport::default();
        for payment in stale {
            report.checked += 1;
            let too_old = now - payment.created_at > expire_after;
            let action = match self.gateway.get_payment_status(payment.order_code).await {
                Ok(info) => match info.status {
                    GatewayPaymentStatus::Expired | GatewayPaymentStatus::Cancelled => {
                        Some((PaymentStatus::Expired, format!("gateway reports {:?}", info.status)))
                    }
                    GatewayPaymentStatus::Paid => Some((
                        PaymentStatus::NeedsReview,
                        "paid at gateway but no webhook received".to_string(),
                    )),
                    _ if too_old => Some((
                        PaymentStatus::Expired,
                        "still open past the expiry window".to_string(),
                    )),
                    _ => None,
                },
                Err(GatewayError::NotFound) => {
                    Some((PaymentStatus::Expired, "not found at gateway".to_string()))
                }
                Err(e) if too_old => Some((
                    PaymentStatus::Expired,
                    format!("lookup failed past the expiry window: {e}"),
                )),
                Err(e) => {
                    tracing::debug!(order_code = %payment.order_code, error = %e, "Reconcile lookup failed");
                    None
                }
            };

            let Some((target, reason)) = action else {
                continue;
            };
            let mut updated = payment.clone();
            updated.fail_with(target, reason, now)?;
            if !self
                .store
                .update_payment_if_status(&updated, PaymentStatus::Pending)?
            {
                continue;
            }
            if target == PaymentStatus::NeedsReview {
                tracing::warn!(order_code = %payment.order_code, "Paid without webhook, payment needs review");
                report.needs_review += 1;
            } else {
                tracing::info!(order_code = %payment.order_code, "Stale payment expired");
                report.expired += 1;
            }
        }

        if report.checked > 0 {
            tracing::info!(
                checked = report.checked,
                expired = report.expired,
                needs_review = report.needs_review,
                "Payment reconcile finished"
            );
        }
        Ok(report)
    }

    /// Retry credit grants for paid payments that were not credited.
    pub fn retry_credits(&self, now: DateTime<Utc>) -> Result<usize> {
        let batch = self.config.credit_retry_batch;
        let max = self.config.credit_retry_max_attempts;
        let mut due = Vec::new();

        for payment in self
            .store
            .list_payments_by_status(PaymentStatus::PaidCreditFailed, now, batch)?
        {
            if payment.credit_retry_count < max {
                due.push(payment);
                continue;
            }
            let mut parked = payment;
            let expected = parked.status;
            parked.transition(PaymentStatus::NeedsReview, now)?;
            if self.store.update_payment_if_status(&parked, expected)? {
                tracing::error!(order_code = %parked.order_code, "Credit retries exhausted, payment needs review");
            }
        }

        let stuck_before = now - chrono::Duration::minutes(STUCK_PAID_AFTER_MINUTES);
        due.extend(
            self.store
                .list_payments_by_status(PaymentStatus::Paid, now, batch)?
                .into_iter()
                .filter(|p| p.paid_at.is_some_and(|at| at < stuck_before)),
        );

        let mut credited = 0;
        for payment in due {
            tracing::info!(
                order_code = %payment.order_code,
                attempt = payment.credit_retry_count + 1,
                "Retrying credit grant"
            );
            if self.credit(&payment) {
                credited += 1;
            }
        }
        Ok(credited)
    }

    /// Delete old FAILED, EXPIRED and CANCELLED payments.
    pub fn purge(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono_duration(self.config.purge_retention);
        let mut removed = 0;
        for status in [
            PaymentStatus::Failed,
            PaymentStatus::Expired,
            PaymentStatus::Cancelled,
        ] {
            for payment in self
                .store
                .list_payments_by_status(status, cutoff, PURGE_BATCH)?
            {
                self.store.delete_payment(&payment.id)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Old payments purged");
        }
        Ok(removed)
    }
}
