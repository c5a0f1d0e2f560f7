//! Chat service: conversation history, budgeting and model calls.
//!
//! The service exclusively owns the history. It inserts the system prompt on
//! the first request of a session, runs every new input through
//! [`budget::reduce`] before anything goes over the network, and delivers the
//! reply to the host either streamed or in one piece.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::core::budget::{self, BudgetLimits, TokenCounter};
use crate::core::model_info::ModelProfile;
use crate::core::tool_calls::ToolCallAccumulator;
use crate::core::types::{Cancelled, ChatMessage, RenderingMode};
use crate::io::backend::{ChatBackend, ChatDelta, ChatReply, ChatRequest};
use crate::io::host::Host;

pub struct ChatService {
    backend: Arc<dyn ChatBackend>,
    counter: Arc<dyn TokenCounter>,
    profile: ModelProfile,
    max_response_tokens: u32,
    system_prompt: Vec<String>,
    history: Vec<ChatMessage>,
}

impl ChatService {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        counter: Arc<dyn TokenCounter>,
        profile: ModelProfile,
        max_response_tokens: u32,
    ) -> Self {
        Self {
            backend,
            counter,
            profile,
            max_response_tokens,
            system_prompt: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn has_system_prompt(&self) -> bool {
        !self.system_prompt.is_empty()
    }

    /// System messages inserted at the start of the next session.
    pub fn set_system_prompt(&mut self, messages: Vec<String>) {
        self.system_prompt = messages;
    }

    /// Forget the conversation. The system prompt is rebuilt by the caller.
    pub fn clear(&mut self) {
        self.history.clear();
        self.system_prompt.clear();
    }

    /// Append a message produced by this turn (assistant reply, tool answer,
    /// run feedback) without budgeting it.
    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    fn limits(&self) -> BudgetLimits {
        BudgetLimits::new(&self.profile, self.max_response_tokens as usize)
    }

    /// Cut tool output that would not fit a reply-sized slice of the window.
    pub fn truncate_tool_output(&self, output: &str) -> String {
        budget::truncate_to_tokens(
            self.counter.as_ref(),
            output,
            self.max_response_tokens as usize,
        )
    }

    /// Send `input` as a user message and return the model's reply.
    ///
    /// The input is budgeted before any network call; an input that cannot
    /// fit fails with [`budget::InputTooLong`]. Cancellation before or during
    /// the reply fails with [`Cancelled`].
    #[instrument(skip_all, fields(mode = ?mode, tools = tools.len()))]
    pub async fn send(
        &mut self,
        input: &str,
        tools: &[Value],
        mode: RenderingMode,
        host: &dyn Host,
        cancel: &CancellationToken,
    ) -> Result<ChatReply> {
        if self.history.is_empty() {
            self.history
                .extend(self.system_prompt.iter().cloned().map(ChatMessage::system));
        }
        let limits = self.limits();
        budget::reduce(
            &mut self.history,
            ChatMessage::user(input),
            self.counter.as_ref(),
            &limits,
        )?;
        debug!(messages = self.history.len(), "history budgeted");

        let request = ChatRequest {
            messages: self.history.clone(),
            tools: tools.to_vec(),
            max_tokens: self.max_response_tokens,
        };
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        host.status("Thinking...").await;
        match mode {
            RenderingMode::FullResponse => {
                let reply = tokio::select! {
                    () = cancel.cancelled() => return Err(Cancelled.into()),
                    reply = self.backend.complete(&request) => reply?,
                };
                if !reply.content.is_empty() {
                    host.render_full(&reply.content).await?;
                }
                Ok(reply)
            }
            RenderingMode::Streaming => self.receive_stream(&request, host, cancel).await,
        }
    }

    async fn receive_stream(
        &self,
        request: &ChatRequest,
        host: &dyn Host,
        cancel: &CancellationToken,
    ) -> Result<ChatReply> {
        let mut stream = tokio::select! {
            () = cancel.cancelled() => return Err(Cancelled.into()),
            stream = self.backend.stream(request) => stream?,
        };
        let mut content = String::new();
        let mut calls = ToolCallAccumulator::default();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    if !content.is_empty() {
                        host.end_stream().await?;
                    }
                    return Err(Cancelled.into());
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ChatDelta::Content(delta))) => {
                    host.render_delta(&delta).await?;
                    content.push_str(&delta);
                }
                Some(Ok(ChatDelta::ToolCall(delta))) => calls.push(delta),
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        if !content.is_empty() {
            host.end_stream().await?;
        }
        let tool_calls = calls.finish();
        if content.is_empty() && tool_calls.is_empty() {
            return Err(anyhow!("model returned an empty reply"));
        }
        Ok(ChatReply {
            content,
            tool_calls,
        })
    }
}
