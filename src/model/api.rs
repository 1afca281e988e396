//! OpenAI-compatible chat completion client.
//!
//! Provides typed request/response structures and a [`CompletionProvider`]
//! implementation that classifies HTTP failures into the retryable
//! (`RateLimited`, `Timeout`) and permanent (`Provider`) kinds.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::provider::{CompletionProvider, SamplingParams};
use crate::error::CompletionError;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A single completion choice returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    /// The reason the model stopped generating (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// A chat completion response from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    /// Text of the first choice, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct LlmClient {
    api_base: String,
    api_key: String,
    model_id: String,
    http: reqwest::Client,
}

impl LlmClient {
    /// Create a client for `model_id` served at `base_url`
    /// (e.g. `"https://api.openai.com/v1"`).
    pub fn new(base_url: &str, api_key: &str, model_id: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            api_base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model_id: model_id.to_string(),
            http,
        })
    }

    /// Send a chat completion request and return the parsed response.
    ///
    /// Calls `POST {base_url}/chat/completions`.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<ChatResponse, CompletionError> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(
            model = %self.model_id,
            temperature = params.temperature,
            max_tokens = params.max_tokens,
            "sending chat completion request"
        );

        let body = serde_json::json!({
            "model": self.model_id,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let chat_response: ChatResponse = resp.json().await.map_err(|e| {
            CompletionError::Provider(format!("failed to parse chat completion response: {e}"))
        })?;

        info!(
            model = %self.model_id,
            prompt_tokens = chat_response.usage.prompt_tokens,
            completion_tokens = chat_response.usage.completion_tokens,
            "chat completion succeeded"
        );

        Ok(chat_response)
    }
}

#[async_trait]
impl CompletionProvider for LlmClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(
        &self,
        role: &str,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        let messages = vec![
            ChatMessage::system(format!("You are the {role} of a collaborative research lab.")),
            ChatMessage::user(prompt),
        ];
        let response = self.chat_completion(&messages, params).await?;
        response
            .first_text()
            .map(str::to_string)
            .ok_or_else(|| CompletionError::Provider("response contained no choices".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn classify_transport_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout(err.to_string())
    } else {
        CompletionError::Provider(format!("failed to send chat completion request: {err}"))
    }
}

fn classify_status(status: StatusCode, body: String) -> CompletionError {
    let msg = format!("chat completion API returned {status}: {body}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CompletionError::Timeout(msg),
        // 529 is the "overloaded" status some providers use.
        s if s == StatusCode::SERVICE_UNAVAILABLE || s.as_u16() == 529 => {
            CompletionError::RateLimited(msg)
        }
        _ => CompletionError::Provider(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_constructors() {
        let sys = ChatMessage::system("You are helpful.");
        assert_eq!(sys.role, "system");
        assert_eq!(sys.content, "You are helpful.");
        assert_eq!(ChatMessage::user("Hello").role, "user");
        assert_eq!(ChatMessage::assistant("Hi").role, "assistant");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            CompletionError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, String::new()),
            CompletionError::Timeout(_)
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad".into()),
            CompletionError::Provider(_)
        ));
    }

    #[test]
    fn test_response_without_usage_parses() {
        let json = r#"{"id": "c1", "choices": [{"index": 0, "message": {"role": "assistant", "content": "Action: go"}, "finish_reason": "stop"}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.first_text(), Some("Action: go"));
        assert_eq!(parsed.usage.total_tokens, 0);
    }
}
