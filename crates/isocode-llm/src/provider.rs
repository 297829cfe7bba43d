//! LLM Provider trait

use crate::types::{CallOptions, ChatMessage, Health, LlmReply, ModelInfo};
use futures::Stream;
use std::pin::Pin;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// LLM error types
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The named model is not available on the backend. Never retried.
    #[error("model not found: {model}")]
    ModelNotFound { model: String, hint: String },

    /// 400/422 - retried with progressively simpler requests.
    #[error("bad request ({status}): {body}")]
    BadRequest { status: u16, body: String },

    #[error("empty response from provider")]
    EmptyResponse,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl LlmError {
    /// Whether the backend is telling us the model does not exist. Such
    /// errors are re-raised immediately with a pull hint instead of retried.
    pub fn is_not_found(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("not found") || lower.contains("does not exist")
    }

    /// Transient errors worth a plain retry (network, timeout, empty body).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::NetworkError(_)
                | LlmError::Timeout(_)
                | LlmError::EmptyResponse
                | LlmError::StreamError(_)
        )
    }
}

/// Stream of text deltas.
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<String>> + Send>>;

/// Unified call/stream/vision interface across provider dialects.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One complete reply; may carry native tool calls.
    async fn call(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> LlmResult<LlmReply>;

    /// Streaming text deltas.
    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> LlmResult<LlmStream>;

    /// Multimodal call with one base64-encoded image.
    async fn call_vision(
        &self,
        model: &str,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
        options: &CallOptions,
    ) -> LlmResult<String>;

    async fn list_models(&self) -> LlmResult<Vec<ModelInfo>>;

    async fn health(&self) -> Health;
}
