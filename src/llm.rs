//! Chat-completion providers.
//!
//! One trait, [`CompletionProvider`], backs both the semantic normalizer and
//! answer generation. The HTTP implementation speaks the OpenAI-compatible
//! `POST {url}/chat/completions` protocol (OpenRouter by default).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
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
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// Return the assistant's reply text, trimmed. May be empty.
    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<String>;
}

/// Provider used when `llm.provider = "disabled"`.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionProvider for DisabledCompletion {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _messages: &[ChatMessage], _temperature: f32) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

/// OpenAI-compatible chat completion client.
pub struct OpenAIChat {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAIChat {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Completion API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message"))?;

    // Some providers send `null` content on refusals; treat it as empty.
    Ok(content.as_str().unwrap_or_default().trim().to_string())
}

/// Build a completion provider for `model` from the shared `[llm]` section.
///
/// The normalizer and the answer path use different models over the same
/// endpoint, credentials and client timeout.
pub fn create_completion_provider(
    config: &LlmConfig,
    model: &str,
) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                anyhow::anyhow!("{} environment variable not set", config.api_key_env)
            })?;
            Ok(Arc::new(OpenAIChat::new(
                config.url.clone(),
                Some(api_key),
                model,
                config.timeout_secs,
            )?))
        }
        other => bail!("Unknown llm provider: {}", other),
    }
}
