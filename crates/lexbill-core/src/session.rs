//! Chat sessions and messages.
//!
//! A chat session is the unit of work for chat billing: it is charged one chat
//! credit on its first question, and the charge state records where that charge is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, ReservationId, SessionId, UserId};

/// Billing state of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeState {
    /// No credit held or consumed.
    NotCharged,
    /// A reservation is held while the first answer is produced.
    Charging,
    /// The session's credit has been consumed.
    Charged,
}

/// A chat session with its billing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    /// Identifier.
    pub id: SessionId,
    /// Owner.
    pub user_id: UserId,
    /// Display title.
    pub title: String,
    /// Billing state.
    pub charge_state: ChargeState,
    /// Reservation taken for the first question.
    pub charge_reservation_id: Option<ReservationId>,
    /// Accepted user questions so far.
    pub user_question_count: u32,
    /// Optimistic concurrency token.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    /// Create a new, uncharged session.
    #[must_use]
    pub fn new(user_id: UserId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::generate(),
            user_id,
            title: title.into(),
            charge_state: ChargeState::NotCharged,
            charge_reservation_id: None,
            user_question_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The next question would be the first billable one.
    #[must_use]
    pub fn needs_charge(&self) -> bool {
        self.user_question_count == 0 && self.charge_state == ChargeState::NotCharged
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    /// The end user.
    User,
    /// The AI provider.
    Assistant,
}

/// An append-only chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Identifier.
    pub id: MessageId,
    /// Owning session.
    pub session_id: SessionId,
    /// Author.
    pub role: MessageRole,
    /// Text.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message stamped with `now`.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        role: MessageRole,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            session_id,
            role,
            content: content.into(),
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_needs_charge() {
        let mut session = ChatSession::new(UserId::generate(), "Hợp đồng lao động", Utc::now());
        assert!(session.needs_charge());
        session.user_question_count = 1;
        session.charge_state = ChargeState::Charged;
        assert!(!session.needs_charge());
    }
}
