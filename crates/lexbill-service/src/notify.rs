//! Fire-and-forget collaborators.
//!
//! The billing engine emits two kinds of side events: a notification when a
//! purchase is credited and an audit record for every admin adjustment. Neither
//! may fail the operation that produced it.

use lexbill_core::{OrderCode, UserId};

/// Receives purchase notifications.
pub trait Notifier: Send + Sync {
    /// Credits for a paid order were granted.
    fn credits_granted(&self, user_id: &UserId, order_code: OrderCode, plan_code: &str);
}

/// One administrative balance change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Who made the change.
    pub actor: String,
    /// Affected user.
    pub user_id: UserId,
    /// Chat delta.
    pub chat_delta: i64,
    /// Quiz-generation delta.
    pub quiz_delta: i64,
    /// Free-form reason.
    pub reason: String,
}

/// Receives admin audit events.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: &AuditEvent);
}

/// Writes notifications and audit events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn credits_granted(&self, user_id: &UserId, order_code: OrderCode, plan_code: &str) {
        tracing::info!(
            user_id = %user_id,
            order_code = %order_code,
            plan_code = %plan_code,
            "Purchase credited, notifying user"
        );
    }
}

impl AuditSink for TracingNotifier {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            actor = %event.actor,
            user_id = %event.user_id,
            chat_delta = event.chat_delta,
            quiz_delta = event.quiz_delta,
            reason = %event.reason,
            "Admin credit adjustment"
        );
    }
}
