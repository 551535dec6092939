//! AI provider abstraction.
//!
//! The billing saga only needs "send prompt, get completion". Anything that can
//! answer a [`CompletionRequest`] can be metered.

mod openai;

pub use openai::OpenAiClient;

use async_trait::async_trait;

use lexbill_core::MessageRole;

/// Errors from an AI provider call.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned a non-success status.
    #[error("provider returned {status}: {body}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Response had no usable completion.
    #[error("empty completion")]
    EmptyCompletion,

    /// The call exceeded its deadline.
    #[error("timed out")]
    Timeout,

    /// Client setup failed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// One prior turn sent as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    /// Author.
    pub role: MessageRole,
    /// Text.
    pub content: String,
}

/// Everything the provider sees for one question.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System instructions.
    pub system_prompt: String,
    /// Recent turns, oldest first.
    pub history: Vec<HistoryTurn>,
    /// Caller-supplied reference text (e.g. retrieved legal passages).
    pub context: Option<String>,
    /// The question to answer.
    pub question: String,
}

/// Abstract "send prompt, get completion" interface.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Produce a completion for the request.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError>;
}
