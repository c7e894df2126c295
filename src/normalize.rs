//! Semantic normalizer: rewrites raw parser output into factual prose before
//! it is chunked and embedded.
//!
//! Results are keyed by `sha256(content + metadata_json)` and served from the
//! [`SemanticCache`] when present, so identical units cost at most one model
//! call. Each model call runs under its own deadline; an expired deadline
//! drops the in-flight request.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::cache::SemanticCache;
use crate::config::NormalizerConfig;
use crate::error::NormalizeError;
use crate::llm::{ChatMessage, CompletionProvider};
use crate::models::{ChunkMetadata, FileType};

const SYSTEM_PROMPT: &str = "\
You are a data normalization engine.
Rewrite the input into clear, concise, factual sentences.
Keep the original meaning exactly.
Do not add information, assumptions, interpretations, or opinions.
Do not fill in missing values; incomplete information stays incomplete.
Output plain text only.";

pub struct Normalizer {
    provider: Arc<dyn CompletionProvider>,
    cache: SemanticCache,
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        cache: SemanticCache,
        config: NormalizerConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
        }
    }

    /// Maximum number of units normalized concurrently within one document.
    pub fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Normalize one unit of text.
    ///
    /// Input longer than `max_input_chars` is rejected, never truncated.
    /// When every attempt fails, formats that tolerate a degraded fallback get
    /// their raw text back (uncached); the rest get
    /// [`NormalizeError::Exhausted`].
    pub async fn normalize(
        &self,
        content: &str,
        file_type: FileType,
        metadata: &ChunkMetadata,
    ) -> Result<String, NormalizeError> {
        let len = content.chars().count();
        if len > self.config.max_input_chars {
            return Err(NormalizeError::InputTooLarge {
                len,
                max: self.config.max_input_chars,
            });
        }

        let fields = metadata.prompt_fields();
        let key = cache_key(content, &fields);

        if let Some(hit) = self.cache.get(&key).await.map_err(NormalizeError::Cache)? {
            tracing::debug!(key = %key, "semantic cache hit");
            return Ok(hit);
        }

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(user_prompt(content, file_type, &fields)),
        ];

        let attempts = self.config.max_retries + 1;
        let deadline = Duration::from_secs(self.config.timeout_secs);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            let reason = match tokio::time::timeout(deadline, self.provider.complete(&messages, 0.0))
                .await
            {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    return self
                        .cache
                        .put(&key, text.trim())
                        .await
                        .map_err(NormalizeError::Cache);
                }
                Ok(Ok(_)) => "empty output from model".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}s", self.config.timeout_secs),
            };

            tracing::warn!(
                attempt,
                attempts,
                file_type = %file_type,
                chars = len,
                reason = %reason,
                "semantic normalization attempt failed"
            );
            last_reason = reason;
        }

        if file_type.tolerates_degraded_fallback() {
            tracing::warn!(
                file_type = %file_type,
                "normalization exhausted; using original text"
            );
            return Ok(content.to_string());
        }

        Err(NormalizeError::Exhausted {
            file_type,
            attempts,
            reason: last_reason,
        })
    }
}

/// Hex SHA-256 of the content followed by the metadata's JSON encoding.
pub fn cache_key(content: &str, metadata: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(metadata.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn user_prompt(content: &str, file_type: FileType, fields: &serde_json::Value) -> String {
    let metadata = serde_json::to_string_pretty(fields).unwrap_or_else(|_| fields.to_string());
    format!(
        "Document type: {file_type}\n\n\
         Metadata (reflect it in the output where relevant):\n{metadata}\n\n\
         Raw content:\n{content}\n\n\
         Rewrite the content as complete sentences suitable for vector embedding. \
         Work the page number or row index into the text naturally."
    )
}
