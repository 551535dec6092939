//! Chat session handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use lexbill_core::{ChargeState, ChatMessage, ChatSession, MessageRole, SessionId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Longest question accepted.
const MAX_QUESTION_CHARS: usize = 4000;

/// Longest caller-supplied context accepted.
const MAX_CONTEXT_CHARS: usize = 32_000;

/// Session response.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    /// Session ID.
    pub id: String,
    /// Title.
    pub title: String,
    /// Billing state.
    pub charge_state: ChargeState,
    /// Questions asked so far.
    pub question_count: u32,
    /// Created timestamp.
    pub created_at: String,
    /// Last activity.
    pub updated_at: String,
}

impl From<&ChatSession> for SessionResponse {
    fn from(session: &ChatSession) -> Self {
        Self {
            id: session.id.to_string(),
            title: session.title.clone(),
            charge_state: session.charge_state,
            question_count: session.user_question_count,
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

/// Message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Message ID.
    pub id: String,
    /// Author.
    pub role: MessageRole,
    /// Text.
    pub content: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&ChatMessage> for MessageResponse {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id.to_string(),
            role: message.role,
            content: message.content.clone(),
            created_at: message.created_at.to_rfc3339(),
        }
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("Invalid session ID".into()))
}

/// Create session request.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Optional title.
    #[serde(default)]
    pub title: Option<String>,
}

/// Open a new chat session. Sessions are charged on their first question.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session = state
        .orchestrator()?
        .create_session(&auth.user_id, body.title.as_deref())?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

/// Ask request.
#[derive(Debug, Deserialize)]
pub struct AskRequest {
    /// The question.
    pub question: String,
    /// Reference text assembled by the caller (e.g. retrieved statutes).
    #[serde(default)]
    pub context: Option<String>,
}

/// Ask response.
#[derive(Debug, Serialize)]
pub struct AskResponse {
    /// Session after the exchange.
    pub session: SessionResponse,
    /// Persisted question.
    pub question: MessageResponse,
    /// Persisted answer.
    pub answer: MessageResponse,
    /// Whether this question charged the session.
    pub charged: bool,
}

/// Ask a question in a session.
pub async fn ask(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(session_id): Path<String>,
    Json(body): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;

    let question = body.question.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("Question must not be empty".into()));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Question exceeds {MAX_QUESTION_CHARS} characters"
        )));
    }
    let context = body.context.as_deref().map(str::trim).filter(|c| !c.is_empty());
    if context.is_some_and(|c| c.chars().count() > MAX_CONTEXT_CHARS) {
        return Err(ApiError::BadRequest(format!(
            "Context exceeds {MAX_CONTEXT_CHARS} characters"
        )));
    }

    let answer = state
        .orchestrator()?
        .ask(&auth.user_id, &session_id, question, context)
        .await?;

    Ok(Json(AskResponse {
        session: SessionResponse::from(&answer.session),
        question: MessageResponse::from(&answer.question),
        answer: MessageResponse::from(&answer.answer),
        charged: answer.charged,
    }))
}

/// History response.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    /// The session.
    pub session: SessionResponse,
    /// Messages, oldest first.
    pub messages: Vec<MessageResponse>,
}

/// Get a session's messages.
pub async fn history(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    let (session, messages) = state.orchestrator()?.history(&auth.user_id, &session_id)?;

    Ok(Json(HistoryResponse {
        session: SessionResponse::from(&session),
        messages: messages.iter().map(MessageResponse::from).collect(),
    }))
}
