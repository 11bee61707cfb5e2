//! LLM provider adapter interface and the OpenRouter implementation
//!
//! The generation worker talks to the model through `LlmProvider`, so tests
//! can substitute a mock. Auth failures (401/403) are non-retryable and
//! surface a distinct message so the user knows to fix Settings; rate limits
//! and server errors are retried by the caller with backoff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";
const TEMPERATURE: f32 = 0.8;
const MAX_TOKENS: u32 = 2000;

/// Provider failure taxonomy
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("provider error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("provider transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Auth(_) => false,
            ProviderError::Api { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            ProviderError::Transport(_) => true,
        }
    }
}

/// One completion call; every field comes from the fresh settings snapshot
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_content: &'a str,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one chat completion and return the raw assistant text
    async fn complete(
        &self,
        api_key: &str,
        request: CompletionRequest<'_>,
    ) -> Result<String, ProviderError>;
}

// ============================================================================
// OpenRouter
// ============================================================================

pub struct OpenRouterClient {
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmProvider for OpenRouterClient {
    async fn complete(
        &self,
        api_key: &str,
        request: CompletionRequest<'_>,
    ) -> Result<String, ProviderError> {
        let url = format!("{OPENROUTER_API_URL}/chat/completions");

        let body = ChatRequest {
            model: request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: request.user_content,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        debug!("OpenRouter chat request (model {})", request.model);

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message: String = text.chars().take(300).collect();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(ProviderError::Auth(message));
            }
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("invalid response body: {e}")))?;

        extract_content(parsed).ok_or_else(|| ProviderError::Api {
            status: status.as_u16(),
            message: "no completion content in response".to_string(),
        })
    }
}

fn extract_content(response: ChatResponse) -> Option<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_not_retryable() {
        assert!(!ProviderError::Auth("bad key".into()).is_retryable());
    }

    #[test]
    fn test_rate_limit_and_server_errors_are_retryable() {
        for status in [408, 429, 500, 502, 503, 504] {
            let err = ProviderError::Api {
                status,
                message: String::new(),
            };
            assert!(err.is_retryable(), "status {status} should be retryable");
        }
        assert!(ProviderError::Transport("timeout".into()).is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        for status in [400, 404, 422] {
            let err = ProviderError::Api {
                status,
                message: String::new(),
            };
            assert!(!err.is_retryable(), "status {status} should not be retryable");
        }
    }

    #[test]
    fn test_extract_content() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": "1. hello"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(response).as_deref(), Some("1. hello"));

        let empty: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(extract_content(empty).is_none());

        let blank: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": ""}}]}"#,
        )
        .unwrap();
        assert!(extract_content(blank).is_none());
    }
}
