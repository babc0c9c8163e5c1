//! Language-model client used by the AI-assisted resolver.
//!
//! The resolver depends only on the [`LlmClient`] trait, so tests and
//! embedders can substitute their own transport. [`HttpLlmClient`] talks to
//! any OpenAI-compatible chat-completions endpoint.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::analyzer::Language;
use crate::config::LlmConfig;
use crate::errors::LlmError;

const SYSTEM_PROMPT: &str = "You reconcile concurrent edits to one source file. \
Answer with the merged code in fenced code blocks only.";

/// One completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    /// Full conflict context, including answer-format instructions.
    pub prompt: String,
    /// Language of the code under merge.
    pub language: Language,
}

/// Text-completion collaborator.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Return the model's raw answer text.
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpLlmClient {
    api_url: String,
    model: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpLlmClient {
    /// Build a client from resolved configuration. Fails when no API key was
    /// resolved from the environment.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        info!(api_url = %config.api_url, model = %config.model, "initializing LLM client");
        Ok(Self {
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            api_key,
            http: reqwest::Client::new(),
        })
    }

    fn payload(&self, request: &LlmRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": request.prompt },
            ],
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        debug!(
            len = request.prompt.len(),
            language = %request.language,
            "sending completion request"
        );

        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&self.payload(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "LLM API returned error");
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = resp.json().await?;
        let content = message_content(&body)?;
        debug!(len = content.len(), "completion received");
        Ok(content)
    }
}

/// Pull `choices[0].message.content` out of a chat-completions response.
fn message_content(body: &serde_json::Value) -> Result<String, LlmError> {
    body.pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))
}
