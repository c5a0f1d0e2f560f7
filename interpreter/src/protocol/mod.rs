//! Turn protocols: one model round trip normalized into a [`TurnResult`].
//!
//! Two strategies share one contract:
//! - [`text::TextProtocol`] looks for a fenced code block in a plain reply;
//! - [`function::FunctionProtocol`] offers an `execute` tool and folds the
//!   streamed tool calls.
//!
//! Confirmation, execution and output rendering are shared by both.

pub mod function;
pub mod text;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chat::ChatService;
use crate::core::types::{ExecutionResult, RenderingMode, TurnResult, is_cancelled};
use crate::io::host::Host;
use crate::io::registry::{RUN_CANCELLED, RuntimeRegistry};

pub const RUN_PROMPT: &str =
    "Would you like to run the code? Select 'n' to provide more guidance, the process state will be saved.";
pub const DECLINED: &str = "User chose not to run code.";
pub const REPEATED: &str = "This code is identical to the code that was just run, so it was not run again.";
pub const RESPONSE_CANCELLED: &str = "AI response cancelled.";
pub const NO_OUTPUT: &str = "The code ran without producing any output.";

/// Session switches that shape a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Run code without asking the host.
    pub auto_execution: bool,
    /// Render failing output to the host.
    pub display_errors: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            auto_execution: false,
            display_errors: true,
        }
    }
}

/// Everything a turn may touch.
pub struct TurnContext<'a> {
    pub chat: &'a mut ChatService,
    pub runtimes: &'a mut RuntimeRegistry,
    pub host: &'a dyn Host,
    pub options: ExecutionOptions,
}

/// Input of one turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub input: &'a str,
    pub mode: RenderingMode,
    /// Code of the last successful run; not executed again.
    pub previous_code: &'a str,
}

/// A model calling style.
#[async_trait]
pub trait TurnProtocol: Send + Sync {
    /// Follow-up prompts refer to tool messages instead of inlining output.
    fn is_function_based(&self) -> bool;

    /// Send `request.input`, handle any code in the reply and report.
    async fn send_turn(
        &self,
        ctx: &mut TurnContext<'_>,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TurnResult>;
}

/// What happened to one block of code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Repeated,
    Declined,
    Cancelled,
    Executed(ExecutionResult),
}

/// Ask for confirmation (unless auto-execution is on), run and render.
pub(crate) async fn confirm_and_run(
    ctx: &mut TurnContext<'_>,
    language: &str,
    code: &str,
    previous_code: &str,
    cancel: &CancellationToken,
) -> Result<RunOutcome> {
    if !code.is_empty() && code == previous_code {
        debug!("model repeated the last code, not running it");
        return Ok(RunOutcome::Repeated);
    }
    if !ctx.options.auto_execution {
        match ctx.host.confirm(RUN_PROMPT, cancel).await {
            Ok(true) => {}
            Ok(false) => {
                info!("user declined to run code");
                return Ok(RunOutcome::Declined);
            }
            Err(err) if is_cancelled(&err) => return Ok(RunOutcome::Cancelled),
            Err(err) => return Err(err),
        }
    }

    ctx.host.status(&format!("Running {language} code...")).await;
    let result = ctx.runtimes.run(language, code, cancel).await;
    if result.cancelled {
        ctx.host.render_full(RUN_CANCELLED).await?;
        return Ok(RunOutcome::Cancelled);
    }
    if !result.is_error || ctx.options.display_errors {
        ctx.host
            .render_full(&format_output(&result.language, &result.output))
            .await?;
    }
    Ok(RunOutcome::Executed(result))
}

/// Run output as shown to the user.
pub fn format_output(language: &str, output: &str) -> String {
    let output = output.trim_end();
    let output = if output.is_empty() { NO_OUTPUT } else { output };
    format!("```\n\n{language} output:\n\n{output}\n\n```")
}

/// Record `outcome` on `turn` and return the text for the history message.
pub(crate) fn apply_outcome(chat: &ChatService, turn: &mut TurnResult, outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Repeated => {
            turn.did_user_run = false;
            REPEATED.to_string()
        }
        RunOutcome::Declined => {
            turn.did_user_run = false;
            DECLINED.to_string()
        }
        RunOutcome::Cancelled => {
            turn.was_cancelled = true;
            turn.tool_response_text = Some(RUN_CANCELLED.to_string());
            RUN_CANCELLED.to_string()
        }
        RunOutcome::Executed(result) => {
            let output = if result.output.trim().is_empty() {
                NO_OUTPUT.to_string()
            } else {
                chat.truncate_tool_output(&result.output)
            };
            turn.did_user_run = true;
            turn.had_error = result.is_error;
            turn.tool_response_text = Some(output.clone());
            output
        }
    }
}

/// Result of a turn whose model call was cancelled.
pub(crate) fn cancelled_turn() -> TurnResult {
    TurnResult {
        response_text: RESPONSE_CANCELLED.to_string(),
        was_cancelled: true,
        ..TurnResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_fenced_with_language_header() {
        assert_eq!(
            format_output("python", "hi\n"),
            "```\n\npython output:\n\nhi\n\n```"
        );
        assert!(format_output("python", "\n").contains(NO_OUTPUT));
    }
}
