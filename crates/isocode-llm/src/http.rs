//! HTTP provider speaking the chat-completions and native local dialects.
//!
//! The local-default provider tries chat-completions first and falls back to
//! the native chat endpoint on a failed or empty result; other providers use
//! chat-completions only. 400/422 responses get up to three escalating
//! retries that progressively drop `response_format`, then `tools`, while
//! raising temperature and max tokens.

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{CallOptions, ChatMessage, Health, LlmReply, ModelInfo, ToolSpec};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

const LOCAL_PROVIDER: &str = "local";
/// Ceiling for the last-ditch string-field scan.
const MAX_SCAN_FIELD: usize = 500_000;

pub struct HttpProvider {
    client: Client,
    provider: String,
    base_url: String,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn new(provider: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            provider: provider.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn is_local(&self) -> bool {
        self.provider == LOCAL_PROVIDER
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn post_json(
        &self,
        path: &str,
        body: Value,
        timeout: std::time::Duration,
        model: &str,
    ) -> LlmResult<Value> {
        let response = self
            .request(reqwest::Method::POST, path)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout)
                } else {
                    LlmError::NetworkError(e)
                }
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            if LlmError::is_not_found(&text) {
                return Err(LlmError::ModelNotFound {
                    model: model.to_string(),
                    hint: format!(
                        "pull it on the backend first (e.g. `ollama pull {}`)",
                        model
                    ),
                });
            }
            if status.as_u16() == 400 || status.as_u16() == 422 {
                return Err(LlmError::BadRequest {
                    status: status.as_u16(),
                    body: text,
                });
            }
            return Err(LlmError::RequestFailed(format!("{}: {}", status, text)));
        }

        serde_json::from_str(&text).map_err(|e| {
            LlmError::RequestFailed(format!("invalid JSON from provider: {} ({})", e, text))
        })
    }

    /// Chat-completions body, simplified per retry attempt.
    fn chat_completions_body(
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
        attempt: u32,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        let map = body.as_object_mut().unwrap_or_else(|| unreachable!());

        let temperature = options.temperature.map(|t| {
            if attempt >= 2 {
                (t + 0.2).min(1.0)
            } else {
                t
            }
        });
        if let Some(t) = temperature {
            map.insert("temperature".into(), json!(t));
        }
        if let Some(max) = options.max_tokens {
            let max = if attempt >= 2 { max.saturating_mul(2) } else { max };
            map.insert("max_tokens".into(), json!(max));
        }
        if options.expect_json && attempt == 0 {
            map.insert("response_format".into(), json!({"type": "json_object"}));
        }
        if attempt < 2 {
            if let Some(ref tools) = options.tools {
                map.insert("tools".into(), json!(tools_to_openai(tools)));
                if let Some(ref choice) = options.tool_choice {
                    map.insert("tool_choice".into(), json!(choice));
                }
            }
        }
        body
    }

    async fn call_chat_completions(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> LlmResult<LlmReply> {
        let mut last_err = LlmError::EmptyResponse;
        for attempt in 0..3u32 {
            let body = Self::chat_completions_body(model, messages, options, attempt, false);
            match self
                .post_json("/v1/chat/completions", body, options.timeout, model)
                .await
            {
                Ok(value) => {
                    let tool_calls = extract_tool_calls(&value);
                    match extract_content(&value) {
                        Some(content) if !content.is_empty() || !tool_calls.is_empty() => {
                            return Ok(LlmReply {
                                content,
                                tool_calls,
                            });
                        }
                        _ if !tool_calls.is_empty() => {
                            return Ok(LlmReply {
                                content: String::new(),
                                tool_calls,
                            });
                        }
                        _ => {
                            debug!("empty chat-completions reply, attempt {}", attempt + 1);
                            last_err = LlmError::EmptyResponse;
                        }
                    }
                }
                Err(e @ LlmError::BadRequest { .. }) => {
                    warn!("chat-completions rejected (attempt {}): {}", attempt + 1, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn call_native(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> LlmResult<LlmReply> {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        let map = body.as_object_mut().unwrap_or_else(|| unreachable!());
        if options.expect_json {
            map.insert("format".into(), json!("json"));
        }
        let mut opts = serde_json::Map::new();
        if let Some(t) = options.temperature {
            opts.insert("temperature".into(), json!(t));
        }
        if let Some(m) = options.max_tokens {
            opts.insert("num_predict".into(), json!(m));
        }
        if !opts.is_empty() {
            map.insert("options".into(), Value::Object(opts));
        }

        let value = self
            .post_json("/api/chat", body, options.timeout, model)
            .await?;
        match extract_content(&value) {
            Some(content) if !content.is_empty() => Ok(LlmReply::text(content)),
            _ => Err(LlmError::EmptyResponse),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn call(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> LlmResult<LlmReply> {
        match self.call_chat_completions(model, messages, options).await {
            Ok(reply) => Ok(reply),
            Err(e @ LlmError::ModelNotFound { .. }) => Err(e),
            Err(e) if self.is_local() => {
                debug!("chat-completions failed ({}), falling back to native", e);
                self.call_native(model, messages, options).await
            }
            Err(e) => Err(e),
        }
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> LlmResult<LlmStream> {
        // Native endpoint for the local provider, chat-completions SSE for
        // the rest. Both framings funnel into plain text deltas.
        if self.is_local() {
            let body = json!({"model": model, "messages": messages, "stream": true});
            let response = self
                .request(reqwest::Method::POST, "/api/chat")
                .timeout(options.timeout)
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                if LlmError::is_not_found(&text) {
                    return Err(LlmError::ModelNotFound {
                        model: model.to_string(),
                        hint: format!("pull it on the backend first (e.g. `ollama pull {}`)", model),
                    });
                }
                return Err(LlmError::RequestFailed(text));
            }
            Ok(Box::pin(parse_ndjson_stream(response.bytes_stream())))
        } else {
            let body = Self::chat_completions_body(model, messages, options, 0, true);
            let response = self
                .request(reqwest::Method::POST, "/v1/chat/completions")
                .timeout(options.timeout)
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(LlmError::RequestFailed(text));
            }
            Ok(Box::pin(parse_sse_stream(response.bytes_stream())))
        }
    }

    async fn call_vision(
        &self,
        model: &str,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
        options: &CallOptions,
    ) -> LlmResult<String> {
        if self.is_local() {
            // Native multimodal shape: images alongside the message content.
            let body = json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt, "images": [image_base64]}],
                "stream": false,
            });
            let value = self
                .post_json("/api/chat", body, options.timeout, model)
                .await?;
            return extract_content(&value).ok_or(LlmError::EmptyResponse);
        }

        let body = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:{};base64,{}", mime_type, image_base64)
                    }},
                ],
            }],
            "stream": false,
        });
        let value = self
            .post_json("/v1/chat/completions", body, options.timeout, model)
            .await?;
        extract_content(&value).ok_or(LlmError::EmptyResponse)
    }

    async fn list_models(&self) -> LlmResult<Vec<ModelInfo>> {
        // Native tag endpoint first, chat-completions models endpoint second.
        let tags = self
            .request(reqwest::Method::GET, "/api/tags")
            .send()
            .await;
        if let Ok(response) = tags {
            if response.status().is_success() {
                if let Ok(value) = response.json::<Value>().await {
                    if let Some(models) = value["models"].as_array() {
                        return Ok(models
                            .iter()
                            .filter_map(|m| {
                                let name = m["name"].as_str()?;
                                let mut info = ModelInfo::new(name);
                                info.size = m["size"].as_u64();
                                Some(info)
                            })
                            .collect());
                    }
                }
            }
        }

        let response = self
            .request(reqwest::Method::GET, "/v1/models")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LlmError::RequestFailed(format!(
                "models endpoint: {}",
                response.status()
            )));
        }
        let value: Value = response.json().await?;
        Ok(value["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(ModelInfo::new))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn health(&self) -> Health {
        match self.list_models().await {
            Ok(_) => Health {
                ok: true,
                provider: self.provider.clone(),
                error: None,
            },
            Err(e) => Health {
                ok: false,
                provider: self.provider.clone(),
                error: Some(e.to_string()),
            },
        }
    }
}

fn tools_to_openai(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect()
}

/// Native tool-call list, when the provider reports one.
pub(crate) fn extract_tool_calls(value: &Value) -> Vec<isocode_core::ToolCall> {
    let calls = value["choices"][0]["message"]["tool_calls"]
        .as_array()
        .or_else(|| value["message"]["tool_calls"].as_array());
    let Some(calls) = calls else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|c| {
            let function = c.get("function").unwrap_or(c);
            let name = function["name"].as_str()?.to_string();
            let arguments = match &function["arguments"] {
                Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
                other => other.clone(),
            };
            Some(isocode_core::ToolCall { name, arguments })
        })
        .collect()
}

/// Exhaustive content extraction across dialect shapes.
pub(crate) fn extract_content(value: &Value) -> Option<String> {
    let choice = &value["choices"][0];

    if let Some(s) = choice["message"]["content"].as_str() {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    if let Some(parts) = choice["message"]["content"].as_array() {
        let joined: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    if let Some(s) = choice["message"]["reasoning_content"].as_str() {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    if let Some(s) = choice["text"].as_str() {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    // Native chat endpoint shape.
    if let Some(s) = value["message"]["content"].as_str() {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    for key in ["output", "text", "response"] {
        if let Some(s) = value[key].as_str() {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    // Last ditch: any non-empty string field of plausible size.
    scan_for_string(value)
}

const SCAN_SKIP_KEYS: &[&str] = &[
    "id",
    "object",
    "model",
    "role",
    "created",
    "created_at",
    "finish_reason",
    "stop_reason",
    "system_fingerprint",
    "done_reason",
];

fn scan_for_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() && s.len() < MAX_SCAN_FIELD => Some(s.clone()),
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !SCAN_SKIP_KEYS.contains(&k.as_str()))
            .find_map(|(_, v)| scan_for_string(v)),
        Value::Array(items) => items.iter().find_map(scan_for_string),
        _ => None,
    }
}

/// SSE `data:` framing used by the chat-completions dialect, terminated by
/// `[DONE]` or a `finish_reason=stop` marker.
fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = LlmResult<String>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        tokio::pin!(bytes_stream);

        'outer: while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::StreamError(e.to_string()));
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'outer;
                }
                let Ok(value) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                    if !delta.is_empty() {
                        yield Ok(delta.to_string());
                    }
                }
                if value["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break 'outer;
                }
            }
        }
    }
}

/// Newline-delimited JSON framing used by the native endpoint.
fn parse_ndjson_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = LlmResult<String>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        tokio::pin!(bytes_stream);

        'outer: while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::StreamError(e.to_string()));
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(delta) = value["message"]["content"].as_str() {
                    if !delta.is_empty() {
                        yield Ok(delta.to_string());
                    }
                }
                if value["done"].as_bool() == Some(true) {
                    break 'outer;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_openai_string_content() {
        let v = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_content(&v).as_deref(), Some("hello"));
    }

    #[test]
    fn extract_content_parts() {
        let v = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "part one "},
            {"type": "text", "text": "part two"},
        ]}}]});
        assert_eq!(extract_content(&v).as_deref(), Some("part one part two"));
    }

    #[test]
    fn extract_reasoning_content() {
        let v = json!({"choices": [{"message": {"content": "", "reasoning_content": "thinking"}}]});
        assert_eq!(extract_content(&v).as_deref(), Some("thinking"));
    }

    #[test]
    fn extract_native_shape() {
        let v = json!({"message": {"content": "native reply"}, "done": true});
        assert_eq!(extract_content(&v).as_deref(), Some("native reply"));
    }

    #[test]
    fn extract_last_ditch_scan_skips_metadata() {
        let v = json!({"model": "m1", "weird": {"nested": {"blob": "found me"}}});
        assert_eq!(extract_content(&v).as_deref(), Some("found me"));
    }

    #[test]
    fn extract_nothing_from_empty() {
        let v = json!({"choices": [{"message": {"content": ""}}], "model": "m"});
        assert_eq!(extract_content(&v), None);
    }

    #[test]
    fn extract_tool_calls_with_string_arguments() {
        let v = json!({"choices": [{"message": {"tool_calls": [
            {"function": {"name": "read_file", "arguments": "{\"path\": \"a.ts\"}"}}
        ]}}]});
        let calls = extract_tool_calls(&v);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "a.ts");
    }

    #[test]
    fn body_degrades_across_attempts() {
        let options = CallOptions {
            expect_json: true,
            temperature: Some(0.2),
            max_tokens: Some(1000),
            tools: Some(vec![ToolSpec {
                name: "t".into(),
                description: "d".into(),
                parameters: json!({}),
            }]),
            ..Default::default()
        };
        let msgs = vec![ChatMessage::new("user", "hi")];

        let b0 = HttpProvider::chat_completions_body("m", &msgs, &options, 0, false);
        assert!(b0.get("response_format").is_some());
        assert!(b0.get("tools").is_some());

        let b1 = HttpProvider::chat_completions_body("m", &msgs, &options, 1, false);
        assert!(b1.get("response_format").is_none());
        assert!(b1.get("tools").is_some());

        let b2 = HttpProvider::chat_completions_body("m", &msgs, &options, 2, false);
        assert!(b2.get("tools").is_none());
        assert_eq!(b2["max_tokens"], 2000);
        assert!(b2["temperature"].as_f64().unwrap() > 0.3);
    }

    #[test]
    fn not_found_detection() {
        assert!(LlmError::is_not_found("model 'x' not found, try pulling it"));
        assert!(LlmError::is_not_found("The model does not exist"));
        assert!(!LlmError::is_not_found("connection refused"));
    }
}
