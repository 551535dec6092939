//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use lexbill_core::MessageRole;

use super::{AiError, AiProvider, CompletionRequest};
use crate::config::AiConfig;

/// Chat-completions client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    /// Create a client with a per-request timeout.
    pub fn new(config: &AiConfig, timeout: Duration) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AiError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn messages(request: &CompletionRequest) -> Vec<Value> {
        let mut messages = Vec::with_capacity(request.history.len() + 3);
        messages.push(json!({"role": "system", "content": request.system_prompt}));
        if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
            messages.push(json!({
                "role": "system",
                "content": format!("Reference material:\n{context}")
            }));
        }
        for turn in &request.history {
            let role = match turn.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": request.question}));
        messages
    }
}

#[async_trait]
impl AiProvider for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": Self::messages(request),
        });

        tracing::debug!(url = %url, model = %self.model, "Calling AI provider");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout
                } else {
                    AiError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletion = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(AiError::EmptyCompletion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::HistoryTurn;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenAiClient {
        OpenAiClient::new(
            &AiConfig {
                base_url: format!("{}/v1/", server.uri()),
                api_key: "sk-test".into(),
                model: "test-model".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "You are a legal assistant.".into(),
            history: vec![HistoryTurn {
                role: MessageRole::User,
                content: "Hello".into(),
            }],
            context: Some("Article 1".into()),
            question: "What is a contract?".into(),
        }
    }

    #[tokio::test]
    async fn returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "An agreement."}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answer = client(&server).complete(&request()).await.unwrap();
        assert_eq!(answer, "An agreement.");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, AiError::Api { status: 503, .. }));
    }

    #[tokio::test]
    async fn blank_completion_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "  "}}]
            })))
            .mount(&server)
            .await;

        let err = client(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, AiError::EmptyCompletion));
    }

    #[test]
    fn messages_put_context_before_history() {
        let messages = OpenAiClient::messages(&request());
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[1]["content"].as_str().unwrap().contains("Article 1"));
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[3]["content"], "What is a contract?");
    }
}
