//! Per-backend request construction and response handling, grounded in
//! `cloudllm::client_wrapper::ClientWrapper` (the unified interface over a vendor) and
//! `cloudllm::clients::common` (the manual JSON wire serialization, SSE consumption,
//! and tool-call reassembly this module generalizes into a single OpenAI-compatible
//! adapter usable by any provider that speaks that dialect).

use crate::functions::FunctionSchema;
use crate::errors::{ReverieError, Result};
use crate::model::{ConversationMessage, ConversationRole, ToolCall};
use crate::provider::http::get_http_client;
use crate::provider::ssrf_guard::validate_loopback_url;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
pub struct ProviderAuth {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub provider_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub tool_choice: Option<String>,
    /// Local/on-device backends must reject non-loopback hosts (SSRF guard); remote
    /// backends use HTTPS and skip the loopback check.
    pub loopback_only: bool,
    /// Reasoning-block delimiter pair, e.g. `("<think>", "</think>")`. Per the open
    /// question in §9, support is per-adapter rather than a fixed global pair.
    pub reasoning_tag: Option<(String, String)>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum AdapterProgress {
    Token(String),
    Thinking(String),
}

#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub thinking: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_key(&self) -> &str;

    async fn call(
        &self,
        auth: &ProviderAuth,
        config: &AdapterConfig,
        messages: &[ConversationMessage],
        tools: &[FunctionSchema],
        on_progress: Option<mpsc::Sender<AdapterProgress>>,
    ) -> Result<AdapterResponse>;
}

fn role_str(role: ConversationRole) -> &'static str {
    match role {
        ConversationRole::System => "system",
        ConversationRole::User => "user",
        ConversationRole::Assistant => "assistant",
        ConversationRole::Tool => "tool",
    }
}

fn message_to_json(message: &ConversationMessage) -> Value {
    let mut obj = json!({ "role": role_str(message.role) });
    if let Some(content) = &message.content {
        obj["content"] = json!(content);
    }
    if !message.tool_calls.is_empty() {
        obj["tool_calls"] = json!(message
            .tool_calls
            .iter()
            .map(|tc| json!({
                "id": tc.id,
                "type": "function",
                "function": { "name": tc.function_name, "arguments": tc.arguments },
            }))
            .collect::<Vec<_>>());
    }
    if let Some(call_id) = &message.tool_call_id {
        obj["tool_call_id"] = json!(call_id);
    }
    obj
}

fn schema_to_json(schema: &FunctionSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.parameters_json(),
        }
    })
}

/// Generic adapter for any backend speaking the OpenAI chat-completions dialect:
/// cloud vendors via a distinct `base_url` (mirroring `ClaudeClient`/`GrokClient`'s
/// delegate-to-`OpenAIClient` pattern), and on-device servers guarded by the SSRF check.
pub struct OpenAiCompatibleAdapter;

impl OpenAiCompatibleAdapter {
    pub fn new() -> Self {
        OpenAiCompatibleAdapter
    }

    fn build_request_body(
        &self,
        config: &AdapterConfig,
        messages: &[ConversationMessage],
        tools: &[FunctionSchema],
        streaming: bool,
    ) -> Value {
        let mut body = json!({
            "model": config.model,
            "messages": messages.iter().map(message_to_json).collect::<Vec<_>>(),
            "stream": streaming,
        });
        if let Some(v) = config.max_tokens {
            body["max_tokens"] = json!(v);
        }
        if let Some(v) = config.temperature {
            body["temperature"] = json!(v);
        }
        if let Some(v) = config.top_p {
            body["top_p"] = json!(v);
        }
        if let Some(v) = config.frequency_penalty {
            body["frequency_penalty"] = json!(v);
        }
        if let Some(v) = config.presence_penalty {
            body["presence_penalty"] = json!(v);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools.iter().map(schema_to_json).collect::<Vec<_>>());
            if let Some(choice) = &config.tool_choice {
                body["tool_choice"] = json!(choice);
            }
        }
        body
    }

    async fn read_error_body(response: reqwest::Response) -> String {
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = response.text().await.unwrap_or_default();

        if content_type.contains("json") {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .or_else(|| value.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or(&text)
                    .to_string();
                return format!("HTTP {status}: {message}");
            }
        }
        let preview: String = text.chars().take(500).collect();
        format!("HTTP {status}: {preview}")
    }

    /// Issues the request body with `stream` forced to `false` and parses the single
    /// JSON response body, forwarding the full answer to `on_progress` as one token so
    /// callers relying on streaming semantics still see something.
    async fn call_non_streaming(
        &self,
        config: &AdapterConfig,
        streaming_body: &Value,
        auth: &ProviderAuth,
        on_progress: Option<mpsc::Sender<AdapterProgress>>,
    ) -> Result<AdapterResponse> {
        let url = if config.loopback_only {
            validate_loopback_url(&format!("{}/chat/completions", config.base_url), 1024)
                .map_err(ReverieError::validation)?
        } else {
            reqwest::Url::parse(&format!("{}/chat/completions", config.base_url))
                .map_err(|e| ReverieError::validation(e.to_string()))?
        };

        let mut body = streaming_body.clone();
        body["stream"] = json!(false);
        let client = get_http_client(&config.base_url);
        let mut request = client.post(url).json(&body);
        if let Some(key) = &auth.api_key {
            request = request.bearer_auth(key);
        }

        let response = match tokio::time::timeout(config.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ReverieError::Connection { message: e.to_string() }),
            Err(_) => return Err(ReverieError::Timeout(config.request_timeout.as_millis() as u64)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = Self::read_error_body(response).await;
            return Err(Self::classify_http_error(status, &body, None));
        }

        let result = Self::parse_non_streaming_body(response).await?;
        if let (Some(tx), Some(content)) = (on_progress, &result.message.content) {
            let _ = tx.send(AdapterProgress::Token(content.clone())).await;
        }
        Ok(result)
    }

    async fn parse_non_streaming_body(response: reqwest::Response) -> Result<AdapterResponse> {
        let text = response.text().await.map_err(|e| ReverieError::Connection { message: e.to_string() })?;
        let parsed: Value = serde_json::from_str(&text).map_err(|e| ReverieError::parse(e.to_string()))?;
        let choice = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ReverieError::parse("response missing choices[0]"))?;
        let message = choice.get("message").ok_or_else(|| ReverieError::parse("response missing message"))?;
        let content = message.get("content").and_then(|v| v.as_str()).map(str::to_string);
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| ToolCall {
                        id: call.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        function_name: call
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: normalize_tool_arguments(
                            call.get("function")
                                .and_then(|f| f.get("arguments"))
                                .and_then(|v| v.as_str())
                                .unwrap_or("{}"),
                        ),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(AdapterResponse {
            message: ResponseMessage {
                role: "assistant".to_string(),
                content,
                tool_calls,
            },
            finish_reason: choice.get("finish_reason").and_then(|v| v.as_str()).map(str::to_string),
            model: parsed.get("model").and_then(|v| v.as_str()).map(str::to_string),
            usage: parsed.get("usage").map(|u| TokenUsage {
                input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                output_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            }),
            thinking: None,
        })
    }

    /// Classifies a non-2xx response. `retry_after_ms` comes from a `Retry-After` header
    /// when present; absent a hint, rate limits fall back to a default 1s wait per §4.9.
    fn classify_http_error(status: reqwest::StatusCode, body: &str, retry_after_ms: Option<u64>) -> ReverieError {
        let code = status.as_u16();
        if code == 429 {
            ReverieError::RateLimit {
                retry_after_ms: retry_after_ms.unwrap_or(1000),
            }
        } else if code == 401 || code == 403 {
            ReverieError::Auth { message: body.to_string() }
        } else if code >= 500 {
            ReverieError::Connection { message: body.to_string() }
        } else {
            ReverieError::Validation { message: body.to_string() }
        }
    }
}

impl Default for OpenAiCompatibleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalizes a tool call's accumulated `arguments` fragment into a valid JSON-encoded
/// string: parse-and-retain on success; replace with `"{}"` (and log) on failure.
pub fn normalize_tool_arguments(raw: &str) -> String {
    if raw.trim().is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(_) => raw.to_string(),
        Err(_) => {
            log::warn!("tool call arguments failed to parse as JSON, replacing with '{{}}': {raw}");
            "{}".to_string()
        }
    }
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Incrementally parses an SSE (`data: `-prefixed) or NDJSON byte stream into a final
/// [`AdapterResponse`], per SPEC_FULL §4.8's streaming contract.
async fn consume_stream(
    mut byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    reasoning_tag: Option<(String, String)>,
    buffer_cap: usize,
    on_progress: Option<mpsc::Sender<AdapterProgress>>,
) -> Result<AdapterResponse> {
    let mut line_buffer = String::new();
    let mut full_content = String::new();
    let mut tool_calls: HashMap<usize, ToolCallAccumulator> = HashMap::new();
    let mut finish_reason = None;
    let mut model = None;
    let mut usage = None;
    let mut in_reasoning_block = false;
    let mut reasoning_buffer = String::new();
    let mut full_thinking = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| ReverieError::Connection { message: e.to_string() })?;
        if line_buffer.len() + chunk.len() > buffer_cap {
            return Err(ReverieError::BackpressureOverflow { limit_bytes: buffer_cap });
        }
        line_buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline_pos) = line_buffer.find('\n') {
            let line = line_buffer[..newline_pos].trim_end_matches('\r').to_string();
            line_buffer.drain(..=newline_pos);

            let payload = if let Some(stripped) = line.strip_prefix("data: ") {
                stripped
            } else if line.starts_with('{') {
                line.as_str()
            } else {
                continue;
            };

            if payload.trim() == "[DONE]" || payload.trim().is_empty() {
                continue;
            }

            let parsed: Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(_) => continue, // one corrupt chunk does not tear down the stream
            };

            if let Some(m) = parsed.get("model").and_then(|v| v.as_str()) {
                model = Some(m.to_string());
            }
            if let Some(u) = parsed.get("usage") {
                usage = Some(TokenUsage {
                    input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    output_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                });
            }

            let Some(choice) = parsed.get("choices").and_then(|c| c.get(0)) else {
                continue;
            };
            if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                finish_reason = Some(fr.to_string());
            }

            // A non-streamed, fully-formed message embedded mid-stream replaces fullContent.
            if let Some(message) = choice.get("message") {
                if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
                    full_content = content.to_string();
                }
                if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
                    for (idx, call) in calls.iter().enumerate() {
                        let entry = tool_calls.entry(idx).or_default();
                        entry.id = call.get("id").and_then(|v| v.as_str()).map(str::to_string);
                        if let Some(function) = call.get("function") {
                            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                                entry.name = name.to_string();
                            }
                            if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                                entry.arguments = args.to_string();
                            }
                        }
                    }
                }
                continue;
            }

            let Some(delta) = choice.get("delta") else { continue };

            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                if let Some((open_tag, close_tag)) = &reasoning_tag {
                    // Track reasoning-block boundaries so reasoning text is forwarded
                    // separately and never appended to fullContent.
                    let mut remaining = content;
                    loop {
                        if in_reasoning_block {
                            if let Some(close_at) = remaining.find(close_tag.as_str()) {
                                reasoning_buffer.push_str(&remaining[..close_at]);
                                full_thinking.push_str(&reasoning_buffer);
                                if let Some(tx) = &on_progress {
                                    let _ = tx.send(AdapterProgress::Thinking(reasoning_buffer.clone())).await;
                                }
                                reasoning_buffer.clear();
                                in_reasoning_block = false;
                                remaining = &remaining[close_at + close_tag.len()..];
                            } else {
                                reasoning_buffer.push_str(remaining);
                                break;
                            }
                        } else if let Some(open_at) = remaining.find(open_tag.as_str()) {
                            full_content.push_str(&remaining[..open_at]);
                            if let Some(tx) = &on_progress {
                                let _ = tx.send(AdapterProgress::Token(remaining[..open_at].to_string())).await;
                            }
                            in_reasoning_block = true;
                            remaining = &remaining[open_at + open_tag.len()..];
                        } else {
                            full_content.push_str(remaining);
                            if let Some(tx) = &on_progress {
                                let _ = tx.send(AdapterProgress::Token(remaining.to_string())).await;
                            }
                            break;
                        }
                    }
                } else {
                    full_content.push_str(content);
                    if let Some(tx) = &on_progress {
                        let _ = tx.send(AdapterProgress::Token(content.to_string())).await;
                    }
                }
            }

            if let Some(fragments) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for fragment in fragments {
                    let index = fragment.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let entry = tool_calls.entry(index).or_default();
                    if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                        entry.id = Some(id.to_string());
                    }
                    if let Some(function) = fragment.get("function") {
                        if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                            entry.name.push_str(name);
                        }
                        if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                            entry.arguments.push_str(args);
                        }
                    }
                }
            }
        }
    }

    let mut final_tool_calls: Vec<ToolCall> = tool_calls
        .into_iter()
        .collect::<std::collections::BTreeMap<_, _>>()
        .into_values()
        .map(|acc| ToolCall {
            id: acc.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            function_name: acc.name,
            arguments: normalize_tool_arguments(&acc.arguments),
        })
        .collect();
    final_tool_calls.retain(|tc| !tc.function_name.is_empty());

    Ok(AdapterResponse {
        message: ResponseMessage {
            role: "assistant".to_string(),
            content: if full_content.is_empty() { None } else { Some(full_content) },
            tool_calls: final_tool_calls,
        },
        finish_reason,
        model,
        usage,
        thinking: if full_thinking.is_empty() { None } else { Some(full_thinking) },
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn provider_key(&self) -> &str {
        "openai_compatible"
    }

    async fn call(
        &self,
        auth: &ProviderAuth,
        config: &AdapterConfig,
        messages: &[ConversationMessage],
        tools: &[FunctionSchema],
        on_progress: Option<mpsc::Sender<AdapterProgress>>,
    ) -> Result<AdapterResponse> {
        if config.base_url.is_empty() || config.model.is_empty() {
            return Err(ReverieError::validation("adapter config requires a base_url and model"));
        }
        if messages.is_empty() {
            return Err(ReverieError::validation("messages must not be empty"));
        }

        let url = if config.loopback_only {
            validate_loopback_url(&format!("{}/chat/completions", config.base_url), 1024)
                .map_err(ReverieError::validation)?
        } else {
            reqwest::Url::parse(&format!("{}/chat/completions", config.base_url))
                .map_err(|e| ReverieError::validation(e.to_string()))?
        };

        let streaming = on_progress.is_some();
        let body = self.build_request_body(config, messages, tools, streaming);
        let client = get_http_client(&config.base_url);

        let mut request = client.post(url).json(&body);
        if let Some(key) = &auth.api_key {
            request = request.bearer_auth(key);
        }

        let call_future = request.send();
        let response = match tokio::time::timeout(config.request_timeout, call_future).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ReverieError::Connection { message: e.to_string() }),
            Err(_) => return Err(ReverieError::Timeout(config.request_timeout.as_millis() as u64)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|seconds| seconds * 1000);
            let body = Self::read_error_body(response).await;
            return Err(Self::classify_http_error(status, &body, retry_after_ms));
        }

        if streaming {
            let stream = response.bytes_stream();
            let streamed = consume_stream(stream, config.reasoning_tag.clone(), 1024 * 1024, on_progress.clone()).await?;

            // Non-streaming fallback: some local backends occasionally yield a stream
            // that completes with neither content nor tool calls. Reissue the same
            // request non-streamed once and forward the whole answer as a single token,
            // rather than surfacing an empty assistant turn.
            if config.loopback_only && streamed.message.content.is_none() && streamed.message.tool_calls.is_empty() {
                log::warn!(
                    "'{}' produced an empty stream, retrying non-streamed",
                    config.provider_key
                );
                return self.call_non_streaming(config, &body, auth, on_progress).await;
            }
            Ok(streamed)
        } else {
            Self::parse_non_streaming_body(response).await
        }
    }
}
