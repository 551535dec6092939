//! Quiz generation handler.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

const MAX_QUESTIONS: u32 = 30;
const MAX_TOPIC_CHARS: usize = 500;

/// Quiz generation request.
#[derive(Debug, Deserialize)]
pub struct GenerateQuizRequest {
    /// What the quiz is about.
    pub topic: String,
    /// Number of questions (default: 10).
    #[serde(default = "default_question_count")]
    pub question_count: u32,
}

fn default_question_count() -> u32 {
    10
}

/// Quiz generation response.
#[derive(Debug, Serialize)]
pub struct GenerateQuizResponse {
    /// Work unit the credit was charged under.
    pub id: String,
    /// Generated quiz as returned by the provider.
    pub content: String,
}

/// Generate a quiz for one QUIZ_GEN credit. Failed generations are refunded.
pub async fn generate_quiz(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<GenerateQuizRequest>,
) -> Result<Json<GenerateQuizResponse>, ApiError> {
    let topic = body.topic.trim();
    if topic.is_empty() || topic.chars().count() > MAX_TOPIC_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Topic must be 1 to {MAX_TOPIC_CHARS} characters"
        )));
    }
    if !(1..=MAX_QUESTIONS).contains(&body.question_count) {
        return Err(ApiError::BadRequest(format!(
            "question_count must be between 1 and {MAX_QUESTIONS}"
        )));
    }

    let quiz = state
        .orchestrator()?
        .generate_quiz(&auth.user_id, topic, body.question_count)
        .await?;

    Ok(Json(GenerateQuizResponse {
        id: quiz.work_unit_id,
        content: quiz.content,
    }))
}
