//! Test-only fakes for the model backend, the host and token counting.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::budget::TokenCounter;
use crate::core::tool_calls::ToolCallDelta;
use crate::core::types::{Cancelled, ToolCall};
use crate::io::backend::{ChatBackend, ChatDelta, ChatReply, ChatRequest, DeltaStream};
use crate::io::host::Host;

/// Counts whitespace-separated words; deterministic stand-in for a BPE.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Backend that replays scripted replies and records every request.
///
/// Streamed replies are split into fragments: content in two halves, and the
/// arguments of every tool call in two pieces, so consumers exercise the
/// fragment folding path.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ChatReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<ChatReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn next_reply(&self, request: &ChatRequest) -> Result<ChatReply> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted backend ran out of replies"))
    }
}

fn split_half(text: &str) -> (&str, &str) {
    let mut mid = text.len() / 2;
    while !text.is_char_boundary(mid) {
        mid -= 1;
    }
    text.split_at(mid)
}

fn fragments(reply: ChatReply) -> Vec<ChatDelta> {
    let mut deltas = Vec::new();
    let (head, tail) = split_half(&reply.content);
    for part in [head, tail] {
        if !part.is_empty() {
            deltas.push(ChatDelta::Content(part.to_string()));
        }
    }
    for (index, call) in reply.tool_calls.into_iter().enumerate() {
        let (head, tail) = split_half(&call.arguments);
        deltas.push(ChatDelta::ToolCall(ToolCallDelta {
            index: index as u32,
            id: Some(call.id),
            name: Some(call.name),
            arguments: Some(head.to_string()),
        }));
        deltas.push(ChatDelta::ToolCall(ToolCallDelta {
            index: index as u32,
            id: None,
            name: None,
            arguments: Some(tail.to_string()),
        }));
    }
    deltas
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply> {
        self.next_reply(request)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        let reply = self.next_reply(request)?;
        let deltas: Vec<Result<ChatDelta>> = fragments(reply).into_iter().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// Reply with plain text only.
pub fn text_reply(content: &str) -> ChatReply {
    ChatReply {
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

/// Reply with one `execute` tool call.
pub fn execute_reply(id: &str, language: &str, code: &str) -> ChatReply {
    ChatReply {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: "execute".to_string(),
            arguments: serde_json::json!({ "language": language, "code": code }).to_string(),
        }],
    }
}

/// Host that records output and answers confirmations from a queue.
///
/// An empty queue answers `false`.
pub struct ScriptedHost {
    answers: Mutex<VecDeque<bool>>,
    rendered: Mutex<String>,
    prompts: Mutex<Vec<String>>,
    statuses: Mutex<Vec<String>>,
    /// Cancelled instead of answering when a confirmation is requested.
    cancel_on_confirm: Option<CancellationToken>,
}

impl ScriptedHost {
    pub fn new(answers: Vec<bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            rendered: Mutex::new(String::new()),
            prompts: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            cancel_on_confirm: None,
        }
    }

    /// Host that cancels `token` when asked to confirm.
    pub fn cancelling(token: CancellationToken) -> Self {
        Self {
            cancel_on_confirm: Some(token),
            ..Self::new(Vec::new())
        }
    }

    /// Everything rendered so far, concatenated.
    pub fn rendered(&self) -> String {
        self.rendered.lock().expect("rendered lock").clone()
    }

    /// Confirmation prompts shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().expect("statuses lock").clone()
    }
}

#[async_trait]
impl Host for ScriptedHost {
    async fn render_full(&self, text: &str) -> Result<()> {
        self.rendered.lock().expect("rendered lock").push_str(text);
        Ok(())
    }

    async fn render_delta(&self, delta: &str) -> Result<()> {
        self.rendered.lock().expect("rendered lock").push_str(delta);
        Ok(())
    }

    async fn end_stream(&self) -> Result<()> {
        Ok(())
    }

    async fn confirm(&self, prompt: &str, cancel: &CancellationToken) -> Result<bool> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        if let Some(token) = &self.cancel_on_confirm {
            token.cancel();
        }
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(self
            .answers
            .lock()
            .expect("answers lock")
            .pop_front()
            .unwrap_or(false))
    }

    async fn status(&self, text: &str) {
        self.statuses
            .lock()
            .expect("statuses lock")
            .push(text.to_string());
    }
}
