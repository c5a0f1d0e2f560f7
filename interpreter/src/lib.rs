//! Autonomous code-execution core of an AI shell.
//!
//! A language model is asked to accomplish a task; the code it proposes runs
//! in persistent interpreter sessions (PowerShell, Python) and the output is
//! fed back until the model is done, the user declines, or the task is
//! cancelled. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure logic (sentinel harness, output classification, code
//!   extraction, tool-call folding, follow-up decisions, history budgeting).
//! - **[`io`]**: Side effects (interpreter processes, the chat endpoint,
//!   settings files, the terminal host, prompt templates).
//!
//! [`protocol`] turns one model round trip into a [`core::types::TurnResult`],
//! [`task`] loops turns for one request and [`agent`] ties a session together.

pub mod agent;
pub mod chat;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
