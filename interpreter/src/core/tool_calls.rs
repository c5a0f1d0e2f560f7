//! Folding streamed tool-call fragments into finalized calls.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::types::ToolCall;

/// Name of the single tool offered to function-calling models.
pub const EXECUTE_TOOL: &str = "execute";

/// One streamed fragment of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Partially received tool call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingToolCall {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// Accumulates fragments per stream index until the reply ends.
#[derive(Debug, Clone, Default)]
pub struct ToolCallAccumulator {
    pending: BTreeMap<u32, PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, delta: ToolCallDelta) {
        let entry = self.pending.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(name) = delta.name.filter(|name| !name.is_empty()) {
            match entry.name.as_mut() {
                Some(existing) if existing != &name => existing.push_str(&name),
                Some(_) => {}
                None => entry.name = Some(name),
            }
        }
        if let Some(arguments) = delta.arguments {
            entry.arguments.push_str(&arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Finalize calls in index order. Calls that never received an id get
    /// `call_<index>`.
    pub fn finish(self) -> Vec<ToolCall> {
        self.pending
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name.unwrap_or_default(),
                arguments: call.arguments,
            })
            .collect()
    }
}

/// Arguments of the `execute` tool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecuteArgs {
    pub language: String,
    pub code: String,
}

pub fn parse_execute_arguments(arguments: &str) -> Result<ExecuteArgs> {
    serde_json::from_str(arguments).context("parse execute tool arguments")
}
