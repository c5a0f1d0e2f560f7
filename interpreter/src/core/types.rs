//! Shared deterministic types for the interpreter core.
//!
//! These types define the contracts between the runtime layer, the chat
//! service, the turn protocols and the task orchestrator. They carry no I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of one line read from a runtime process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Normal output on stdout.
    Output,
    /// A non-empty line on stderr.
    Error,
    /// The end-of-run sentinel was seen on stdout.
    End,
    /// The interpreter reported that the submission was interrupted.
    Interrupt,
}

/// One classified line of runtime output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub kind: OutputKind,
    pub content: String,
}

impl OutputRecord {
    pub fn output(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Output,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Error,
            content: content.into(),
        }
    }

    /// `tag` is the run number carried by the sentinel, empty when absent.
    pub fn end(tag: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::End,
            content: tag.into(),
        }
    }

    pub fn interrupt(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Interrupt,
            content: content.into(),
        }
    }
}

/// Folded result of one code run, as seen by the turn protocols.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub language: String,
    pub code: String,
    /// Every `Output`/`Error`/`Interrupt` line, each followed by `\n`.
    pub output: String,
    pub is_error: bool,
    /// The run ended through caller cancellation or an interpreter interrupt.
    pub cancelled: bool,
    pub tool_call_id: Option<String>,
}

impl ExecutionResult {
    /// A result for a run that never reached a process.
    pub fn rejected(language: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            language: language.to_string(),
            code: code.to_string(),
            output: message.into(),
            is_error: true,
            cancelled: false,
            tool_call_id: None,
        }
    }
}

/// Chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A finalized tool call attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// Normalized outcome of one model turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TurnResult {
    pub response_text: String,
    pub code_given: bool,
    pub code: Option<String>,
    pub language: Option<String>,
    pub did_user_run: bool,
    pub had_error: bool,
    pub was_cancelled: bool,
    pub tool_response_text: Option<String>,
}

/// How model replies are delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderingMode {
    /// Forward content deltas as they arrive.
    #[default]
    Streaming,
    /// Wait for the whole reply and render it once.
    FullResponse,
}

/// The current operation was cancelled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Returns true when `err` (or anything in its chain) is a [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}
