//! Scripted provider for tests - no network.

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{CallOptions, ChatMessage, Health, LlmReply, ModelInfo};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Prefix of the engine's summarisation instruction. Summary/compaction
/// calls are answered out-of-band so they do not consume scripted replies.
const SUMMARY_PREFIX: &str = "Summarise this agent conversation";

#[derive(Default)]
pub struct MockProvider {
    replies: Mutex<VecDeque<Result<LlmReply, String>>>,
    /// Models that always fail, with their error text. Checked before the
    /// reply queue - lets tests exercise per-model fallback.
    fail_models: Mutex<HashMap<String, String>>,
    models: Mutex<Vec<ModelInfo>>,
    calls: Mutex<Vec<String>>,
    summary_text: Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(LlmReply::text(text)));
    }

    pub fn push_error(&self, error: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Err(error.into()));
    }

    pub fn fail_model(&self, model: impl Into<String>, error: impl Into<String>) {
        self.fail_models
            .lock()
            .unwrap()
            .insert(model.into(), error.into());
    }

    pub fn set_models(&self, ids: &[&str]) {
        *self.models.lock().unwrap() = ids.iter().map(|id| ModelInfo::new(*id)).collect();
    }

    /// Text returned for summarisation calls (compaction, session memory).
    pub fn set_summary_text(&self, text: impl Into<String>) {
        *self.summary_text.lock().unwrap() = Some(text.into());
    }

    /// Models passed to `call`, in order.
    pub fn called_models(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_reply(&self, model: &str, messages: &[ChatMessage]) -> LlmResult<LlmReply> {
        if messages.iter().any(|m| m.content.starts_with(SUMMARY_PREFIX)) {
            let summary = self.summary_text.lock().unwrap().clone().unwrap_or_default();
            return Ok(LlmReply::text(summary));
        }
        self.calls.lock().unwrap().push(model.to_string());
        if let Some(error) = self.fail_models.lock().unwrap().get(model) {
            return Err(LlmError::RequestFailed(error.clone()));
        }
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(error)) => Err(LlmError::RequestFailed(error)),
            None => Ok(LlmReply::text("")),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn call(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &CallOptions,
    ) -> LlmResult<LlmReply> {
        self.next_reply(model, messages)
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &CallOptions,
    ) -> LlmResult<LlmStream> {
        let reply = self.next_reply(model, messages)?;
        let stream = async_stream::stream! {
            if !reply.content.is_empty() {
                yield Ok(reply.content);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn call_vision(
        &self,
        model: &str,
        prompt: &str,
        _image_base64: &str,
        _mime_type: &str,
        _options: &CallOptions,
    ) -> LlmResult<String> {
        let messages = [ChatMessage::new("user", prompt)];
        self.next_reply(model, &messages).map(|r| r.content)
    }

    async fn list_models(&self) -> LlmResult<Vec<ModelInfo>> {
        Ok(self.models.lock().unwrap().clone())
    }

    async fn health(&self) -> Health {
        Health {
            ok: true,
            provider: "mock".to_string(),
            error: None,
        }
    }
}
