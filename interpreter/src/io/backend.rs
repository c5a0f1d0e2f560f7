//! Language-model backend.
//!
//! [`ChatBackend`] is the seam between the chat service and the transport.
//! [`OpenAiBackend`] talks to OpenAI-compatible chat completions, either the
//! public OpenAI API or an Azure OpenAI deployment, and parses streamed
//! replies from server-sent events.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::tool_calls::ToolCallDelta;
use crate::core::types::{ChatMessage, ToolCall};
use crate::io::config::{API_KEY_ENV, EndpointKind, Settings};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const AZURE_API_VERSION: &str = "2024-06-01";
const MAX_RETRIES: u32 = 2;
const FIRST_RETRY_DELAY: Duration = Duration::from_millis(800);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// One request to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tool declarations in chat-completions format. Empty for plain text.
    pub tools: Vec<Value>,
    pub max_tokens: u32,
}

/// One streamed fragment of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDelta {
    Content(String),
    ToolCall(ToolCallDelta),
}

/// A complete reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

pub type DeltaStream = BoxStream<'static, Result<ChatDelta>>;

/// Transport used by the chat service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Request a whole reply.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply>;

    /// Request a reply as a stream of fragments.
    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream>;
}

/// The backend answered with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model backend returned {status}: {body}")]
pub struct BackendError {
    pub status: u16,
    pub body: String,
}

enum Auth {
    Bearer(String),
    ApiKey(String),
}

/// OpenAI or Azure OpenAI chat completions over HTTPS.
pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    auth: Auth,
    /// Sent as `model`; Azure routes by deployment instead.
    model: Option<String>,
}

impl OpenAiBackend {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let key = settings.api_key().ok_or_else(|| {
            anyhow!("no API key configured: set `key` in the settings file or {API_KEY_ENV}")
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        let backend = match settings.endpoint_kind()? {
            EndpointKind::OpenAi => Self {
                client,
                url: OPENAI_URL.to_string(),
                auth: Auth::Bearer(key),
                model: Some(settings.model_name.clone()),
            },
            EndpointKind::Azure {
                endpoint,
                deployment,
            } => Self {
                client,
                url: format!(
                    "{endpoint}/openai/deployments/{deployment}/chat/completions?api-version={AZURE_API_VERSION}"
                ),
                auth: Auth::ApiKey(key),
                model: None,
            },
        };
        Ok(backend)
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "messages": request.messages.iter().map(message_json).collect::<Vec<_>>(),
            "temperature": 0,
            "max_tokens": request.max_tokens,
            "n": 1,
            "stream": stream,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }

    /// POST with bounded retries on throttling and server errors.
    #[instrument(skip_all, fields(url = %self.url))]
    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let builder = self.client.post(&self.url).json(body);
            let builder = match &self.auth {
                Auth::Bearer(key) => builder.bearer_auth(key),
                Auth::ApiKey(key) => builder.header("api-key", key),
            };
            let response = builder.send().await.context("send chat request")?;
            let status = response.status();
            if status.is_success() {
                debug!(status = status.as_u16(), attempt, "chat request accepted");
                return Ok(response);
            }
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt < MAX_RETRIES {
                attempt += 1;
                let delay = retry_delay(attempt);
                warn!(status = status.as_u16(), attempt, delay_ms = delay.as_millis() as u64, "retrying chat request");
                tokio::time::sleep(delay).await;
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError {
                status: status.as_u16(),
                body,
            }
            .into());
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    (FIRST_RETRY_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))).min(MAX_RETRY_DELAY)
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply> {
        let response = self.post(&self.body(request, false)).await?;
        let parsed: CompletionResponse = response.json().await.context("parse chat completion")?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .context("chat completion has no choices")?;
        Ok(ChatReply {
            content: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .into_iter()
                .flatten()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        let response = self.post(&self.body(request, true)).await?;
        Ok(Box::pin(sse_deltas(response.bytes_stream())))
    }
}

/// Decode server-sent events into reply fragments until `[DONE]`.
fn sse_deltas<S, B>(bytes: S) -> impl Stream<Item = Result<ChatDelta>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut lines = SseLineBuffer::default();
        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.context("read chat stream")?;
            for line in lines.push(chunk.as_ref()) {
                match parse_sse_line(&line)? {
                    SseEvent::Done => break 'read,
                    SseEvent::Deltas(deltas) => {
                        for delta in deltas {
                            yield delta;
                        }
                    }
                    SseEvent::Skip => {}
                }
            }
        }
    }
}

fn message_json(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if let Some(name) = &message.name {
        value["name"] = json!(name);
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    if !message.tool_calls.is_empty() {
        if message.content.is_empty() {
            value["content"] = Value::Null;
        }
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect();
    }
    value
}

/// Splits a byte stream into lines, holding back incomplete ones.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
            );
        }
        lines
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Deltas(Vec<ChatDelta>),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(payload).context("parse chat stream chunk")?;
    if let Some(error) = chunk.error {
        bail!("model stream error: {}", error.message);
    }
    let mut deltas = Vec::new();
    for choice in chunk.choices {
        let Some(delta) = choice.delta else { continue };
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            deltas.push(ChatDelta::Content(content));
        }
        for call in delta.tool_calls.into_iter().flatten() {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            deltas.push(ChatDelta::ToolCall(ToolCallDelta {
                index: call.index,
                id: call.id,
                name,
                arguments,
            }));
        }
    }
    Ok(SseEvent::Deltas(deltas))
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_holds_back_partial_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        let lines = buffer.push(b":1}\r\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
    }

    #[test]
    fn parses_content_delta() {
        let event =
            parse_sse_line(r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#).expect("parse");
        assert_eq!(event, SseEvent::Deltas(vec![ChatDelta::Content("Hel".to_string())]));
    }

    #[test]
    fn parses_tool_call_fragments() {
        let first = parse_sse_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"execute","arguments":""}}]}}]}"#,
        )
        .expect("parse");
        assert_eq!(
            first,
            SseEvent::Deltas(vec![ChatDelta::ToolCall(ToolCallDelta {
                index: 0,
                id: Some("call_1".to_string()),
                name: Some("execute".to_string()),
                arguments: Some(String::new()),
            })])
        );
        let next = parse_sse_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"lang"}}]}}]}"#,
        )
        .expect("parse");
        assert_eq!(
            next,
            SseEvent::Deltas(vec![ChatDelta::ToolCall(ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: Some("{\"lang".to_string()),
            })])
        );
    }

    #[test]
    fn done_comments_and_filter_results_are_handled() {
        assert_eq!(parse_sse_line("data: [DONE]").expect("parse"), SseEvent::Done);
        assert_eq!(parse_sse_line(": keep-alive").expect("parse"), SseEvent::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[],"prompt_filter_results":[]}"#).expect("parse"),
            SseEvent::Deltas(Vec::new())
        );
    }

    #[test]
    fn stream_error_payload_is_an_error() {
        let err = parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#).expect_err("error");
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn assistant_tool_calls_serialize_with_null_content() {
        let message = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "execute".to_string(),
                arguments: "{}".to_string(),
            }],
        );
        let value = message_json(&message);
        assert_eq!(value["content"], Value::Null);
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "execute");

        let tool = message_json(&ChatMessage::tool("call_1", "out"));
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
    }

    #[test]
    fn retry_delay_is_capped() {
        assert_eq!(retry_delay(1), FIRST_RETRY_DELAY);
        assert_eq!(retry_delay(2), FIRST_RETRY_DELAY * 2);
        assert_eq!(retry_delay(10), MAX_RETRY_DELAY);
    }

    #[test]
    fn azure_settings_build_deployment_url() {
        let settings = Settings {
            endpoint: Some("https://example.openai.azure.com/".to_string()),
            deployment: Some("gpt4".to_string()),
            key: Some("secret".to_string()),
            ..Settings::default()
        };
        let backend = OpenAiBackend::from_settings(&settings).expect("backend");
        assert!(backend.url.starts_with(
            "https://example.openai.azure.com/openai/deployments/gpt4/chat/completions?api-version="
        ));
        assert!(backend.model.is_none());
        let body = backend.body(
            &ChatRequest {
                messages: vec![ChatMessage::user("hi")],
                tools: Vec::new(),
                max_tokens: 1000,
            },
            true,
        );
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
        assert!(body.get("model").is_none());
    }
}
