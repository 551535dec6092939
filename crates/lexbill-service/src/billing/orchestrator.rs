//! Metered AI work: the chat billing saga and generic reserve/run/settle.
//!
//! A chat session is charged one CHAT credit on its first question. The saga
//! runs in three phases so that no lock or store transaction spans the AI call:
//!
//! 1. **Admit**: check ownership and the question ceiling, reserve a credit on
//!    the first question, and bump the session with a version compare-and-set.
//! 2. **Answer**: call the provider with a deadline.
//! 3. **Settle**: confirm and persist the exchange, or refund and roll the
//!    session back if this request was the one that reserved.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use lexbill_core::{
    BillingError, ChargeState, ChatMessage, ChatSession, CreditType, MessageRole, ReservationId,
    ReservationState, Result, SessionId, UserId,
};
use lexbill_store::Store;

use super::reservation::Reservations;
use crate::ai::{AiError, AiProvider, CompletionRequest, HistoryTurn};
use crate::config::BillingConfig;

/// Operation label stored on chat reservations.
pub const CHAT_OPERATION: &str = "CHAT";

/// Operation label stored on quiz reservations.
pub const QUIZ_OPERATION: &str = "QUIZ_GEN";

const CHAT_SYSTEM_PROMPT: &str = "You are a legal assistant specialised in Vietnamese law. \
Answer in the language of the question and cite the relevant legal provisions where possible. \
If the supplied context does not cover the question, say that you are not certain.";

const QUIZ_SYSTEM_PROMPT: &str = "You write multiple-choice quizzes about Vietnamese law for \
students. Each question has four options labelled A to D and exactly one correct answer. \
Return the quiz as JSON: an array of objects with question, options and answer fields.";

const DEFAULT_SESSION_TITLE: &str = "New conversation";
const MAX_TITLE_CHARS: usize = 200;

/// Messages returned by the history endpoint.
const HISTORY_PAGE: usize = 200;

/// Attempts at the closing session update.
const SETTLE_ATTEMPTS: usize = 3;

/// One answered question.
#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    /// Session after the exchange.
    pub session: ChatSession,
    /// Persisted question.
    pub question: ChatMessage,
    /// Persisted answer.
    pub answer: ChatMessage,
    /// Whether this request charged the session.
    pub charged: bool,
}

/// A generated quiz.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuiz {
    /// Work unit the QUIZ_GEN credit was reserved under.
    pub work_unit_id: String,
    /// Raw provider output.
    pub content: String,
}

/// A session that passed Phase A.
struct Admitted {
    session: ChatSession,
    reservation: Option<ReservationId>,
}

/// Runs billable AI work against reservations.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    reservations: Arc<Reservations>,
    ai: Arc<dyn AiProvider>,
    config: BillingConfig,
}

impl Orchestrator {
    /// Create the orchestrator.
    pub fn new(
        store: Arc<dyn Store>,
        reservations: Arc<Reservations>,
        ai: Arc<dyn AiProvider>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            reservations,
            ai,
            config,
        }
    }

    /// Open a new uncharged session.
    pub fn create_session(&self, user_id: &UserId, title: Option<&str>) -> Result<ChatSession> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map_or_else(
                || DEFAULT_SESSION_TITLE.to_string(),
                |t| t.chars().take(MAX_TITLE_CHARS).collect(),
            );
        let session = ChatSession::new(*user_id, title, Utc::now());
        self.store.insert_session(&session)?;
        tracing::debug!(user_id = %user_id, session_id = %session.id, "Chat session created");
        Ok(session)
    }

    /// A session and its messages in chronological order.
    pub fn history(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
    ) -> Result<(ChatSession, Vec<ChatMessage>)> {
        let session = self.owned_session(user_id, session_id)?;
        let messages = self.store.list_messages(session_id, HISTORY_PAGE)?;
        Ok((session, messages))
    }

    /// Answer a question inside a session, charging the session on its first question.
    pub async fn ask(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        question: &str,
        context: Option<&str>,
    ) -> Result<ChatAnswer> {
        let admitted = self.admit(user_id, session_id).await?;

        let history = match self.store.list_messages(session_id, self.config.history_limit) {
            Ok(messages) => messages,
            Err(e) => {
                self.compensate(&admitted);
                return Err(e.into());
            }
        };
        let request = CompletionRequest {
            system_prompt: CHAT_SYSTEM_PROMPT.to_string(),
            history: history
                .into_iter()
                .map(|m| HistoryTurn {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            context: context.map(str::to_string),
            question: question.to_string(),
        };

        let outcome = match tokio::time::timeout(self.config.ai_timeout, self.ai.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout),
        };

        match outcome {
            Ok(answer) => self.settle_answer(&admitted, question, answer),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    session_id = %session_id,
                    error = %e,
                    "AI provider failed"
                );
                self.compensate(&admitted);
                Err(BillingError::AiProviderFailed(e.to_string()))
            }
        }
    }

    /// Phase A with bounded retry on version conflicts.
    async fn admit(&self, user_id: &UserId, session_id: &SessionId) -> Result<Admitted> {
        let attempts = self.config.charge_max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(admitted) = self.try_admit(user_id, session_id)? {
                return Ok(admitted);
            }
            tracing::debug!(session_id = %session_id, attempt, "Session changed during admit, retrying");
            if attempt < attempts {
                tokio::time::sleep(self.config.charge_backoff * attempt).await;
            }
        }
        Err(BillingError::ConcurrentModification(format!(
            "session {session_id} kept changing"
        )))
    }

    /// One Phase A attempt. `None` means a lost race; nothing is left reserved.
    fn try_admit(&self, user_id: &UserId, session_id: &SessionId) -> Result<Option<Admitted>> {
        let session = self.owned_session(user_id, session_id)?;
        self.admit_from(user_id, session)
    }

    /// Phase A against a session snapshot, committed with a version compare-and-set.
    fn admit_from(&self, user_id: &UserId, session: ChatSession) -> Result<Option<Admitted>> {
        let session_id = session.id;
        let mut next = session.clone();

        if session.charge_state == ChargeState::Charging {
            match self.charge_reservation_state(&session)? {
                Some(ReservationState::Active) => return Err(BillingError::ChargeInProgress),
                Some(ReservationState::Confirmed) => {
                    // The credit was consumed but the session was never closed.
                    tracing::warn!(
                        session_id = %session_id,
                        reservation_id = ?session.charge_reservation_id,
                        "Session left in CHARGING after its charge was confirmed, marking CHARGED"
                    );
                    next.charge_state = ChargeState::Charged;
                }
                Some(ReservationState::Released) | None => {
                    tracing::warn!(
                        session_id = %session_id,
                        reservation_id = ?session.charge_reservation_id,
                        "Session stuck in CHARGING without a live reservation, resetting"
                    );
                    next.charge_state = ChargeState::NotCharged;
                    next.charge_reservation_id = None;
                    next.user_question_count = 0;
                }
            }
        }

        let limit = self.config.question_limit;
        if next.user_question_count >= limit {
            return Err(BillingError::QuestionLimitReached { limit });
        }

        let reservation = if next.needs_charge() {
            match self.reservations.reserve(
                user_id,
                &session_id.to_string(),
                CreditType::Chat,
                CHAT_OPERATION,
            ) {
                Ok(r) => Some(r.id),
                Err(BillingError::ConcurrentModification(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        if let Some(id) = reservation {
            next.charge_state = ChargeState::Charging;
            next.charge_reservation_id = Some(id);
        }
        next.user_question_count += 1;
        next.version += 1;
        next.updated_at = Utc::now();

        if self.store.update_session_if_version(&next, session.version)? {
            return Ok(Some(Admitted {
                session: next,
                reservation,
            }));
        }

        if let Some(id) = reservation {
            self.reservations.refund(&id)?;
        }
        Ok(None)
    }

    fn charge_reservation_state(&self, session: &ChatSession) -> Result<Option<ReservationState>> {
        let Some(id) = session.charge_reservation_id else {
            return Ok(None);
        };
        Ok(self.store.get_reservation(&id)?.map(|r| r.state))
    }

    /// Phase C on success.
    fn settle_answer(&self, admitted: &Admitted, question: &str, answer: String) -> Result<ChatAnswer> {
        let session_id = admitted.session.id;
        if let Some(id) = admitted.reservation {
            if let Err(e) = self.reservations.confirm(&id) {
                tracing::error!(
                    session_id = %session_id,
                    reservation_id = %id,
                    error = %e,
                    "Charge confirm failed after a delivered answer"
                );
            }
        }

        let now = Utc::now();
        let question = ChatMessage::new(session_id, MessageRole::User, question, now);
        let answer = ChatMessage::new(session_id, MessageRole::Assistant, answer, now);
        self.store
            .append_messages(&[question.clone(), answer.clone()])?;

        let session = self.close_session(admitted, now)?;
        Ok(ChatAnswer {
            session,
            question,
            answer,
            charged: admitted.reservation.is_some(),
        })
    }

    /// Mark the session CHARGED (if this request reserved) and touch it.
    fn close_session(&self, admitted: &Admitted, now: DateTime<Utc>) -> Result<ChatSession> {
        let id = admitted.session.id;
        let mut current = admitted.session.clone();
        for _ in 0..SETTLE_ATTEMPTS {
            current = self
                .store
                .get_session(&id)?
                .ok_or_else(|| BillingError::not_found("session", id))?;
            let mut next = current.clone();
            if admitted.reservation.is_some() && next.charge_reservation_id == admitted.reservation {
                next.charge_state = ChargeState::Charged;
            }
            next.version += 1;
            next.updated_at = now;
            if self.store.update_session_if_version(&next, current.version)? {
                return Ok(next);
            }
        }
        tracing::warn!(session_id = %id, "Session kept changing while settling; leaving it as is");
        Ok(current)
    }

    /// Phase C on failure. Only the request that reserved rolls the session back.
    fn compensate(&self, admitted: &Admitted) {
        let Some(reservation_id) = admitted.reservation else {
            return;
        };
        let session_id = admitted.session.id;

        if let Err(e) = self.reservations.refund(&reservation_id) {
            tracing::error!(
                session_id = %session_id,
                reservation_id = %reservation_id,
                error = %e,
                "Refund failed; the expiry sweep will release the reservation"
            );
        }

        for _ in 0..SETTLE_ATTEMPTS {
            let current = match self.store.get_session(&session_id) {
                Ok(Some(s)) => s,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Session reload failed during rollback");
                    return;
                }
            };
            if current.charge_reservation_id != Some(reservation_id) {
                return;
            }
            let mut next = current.clone();
            next.charge_state = ChargeState::NotCharged;
            next.charge_reservation_id = None;
            next.user_question_count = 0;
            next.version += 1;
            next.updated_at = Utc::now();
            match self.store.update_session_if_version(&next, current.version) {
                Ok(true) => {
                    tracing::info!(session_id = %session_id, "Session charge rolled back");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Session rollback failed");
                    return;
                }
            }
        }
        tracing::error!(session_id = %session_id, "Session rollback kept conflicting");
    }

    fn owned_session(&self, user_id: &UserId, session_id: &SessionId) -> Result<ChatSession> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| BillingError::not_found("session", session_id))?;
        if session.user_id != *user_id {
            return Err(BillingError::Forbidden("session belongs to another user".into()));
        }
        Ok(session)
    }

    /// Reserve one credit, run `work` under the AI deadline, then confirm or refund.
    pub async fn run_metered<T, E, F>(
        &self,
        user_id: &UserId,
        credit_type: CreditType,
        work_unit_id: &str,
        operation: &str,
        work: F,
    ) -> Result<T>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>> + Send,
    {
        let reservation = self
            .reservations
            .reserve(user_id, work_unit_id, credit_type, operation)?;

        let failure = match tokio::time::timeout(self.config.ai_timeout, work).await {
            Ok(Ok(value)) => {
                if let Err(e) = self.reservations.confirm(&reservation.id) {
                    tracing::error!(
                        reservation_id = %reservation.id,
                        error = %e,
                        "Confirm failed after completed work"
                    );
                }
                return Ok(value);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => AiError::Timeout.to_string(),
        };

        tracing::warn!(
            user_id = %user_id,
            work_unit_id = %work_unit_id,
            operation = %operation,
            error = %failure,
            "Metered work failed, refunding"
        );
        if let Err(e) = self.reservations.refund(&reservation.id) {
            tracing::error!(reservation_id = %reservation.id, error = %e, "Refund failed");
        }
        Err(BillingError::AiProviderFailed(failure))
    }

    /// Generate a quiz for one QUIZ_GEN credit.
    pub async fn generate_quiz(
        &self,
        user_id: &UserId,
        topic: &str,
        question_count: u32,
    ) -> Result<GeneratedQuiz> {
        let work_unit_id = format!("quiz:{}", uuid::Uuid::new_v4());
        let request = CompletionRequest {
            system_prompt: QUIZ_SYSTEM_PROMPT.to_string(),
            question: format!("Write {question_count} questions about: {topic}"),
            ..CompletionRequest::default()
        };

        let content = self
            .run_metered(
                user_id,
                CreditType::QuizGen,
                &work_unit_id,
                QUIZ_OPERATION,
                self.ai.complete(&request),
            )
            .await?;

        tracing::info!(user_id = %user_id, work_unit_id = %work_unit_id, "Quiz generated");
        Ok(GeneratedQuiz {
            work_unit_id,
            content,
        })
    }
}
