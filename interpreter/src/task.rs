//! Task orchestration: keep the model working on one request until it stops.
//!
//! Each iteration sends one turn through the active [`TurnProtocol`], then
//! lets [`decide`] pick between stopping and a canned follow-up prompt.
//! Typed cancellation errors are mapped to a stop reason here so callers only
//! see real failures as `Err`.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{Decision, StopReason, decide};
use crate::core::types::{RenderingMode, is_cancelled};
use crate::protocol::{TurnContext, TurnProtocol, TurnRequest};

/// Why a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStop {
    /// The input was blank; nothing was sent.
    NoInput,
    Cancelled,
    /// The model answered without code.
    NoCode,
    /// The user declined to run the offered code.
    Declined,
    /// The configured turn cap was reached.
    MaxTurns,
}

impl From<StopReason> for TaskStop {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Cancelled => TaskStop::Cancelled,
            StopReason::NoCode => TaskStop::NoCode,
            StopReason::Declined => TaskStop::Declined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Model turns sent.
    pub turns: usize,
    pub stop: TaskStop,
}

/// Limits for one task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLimits {
    pub mode: RenderingMode,
    /// Zero means unlimited.
    pub max_turns: usize,
}

/// Drive `input` to completion through `protocol`.
#[instrument(skip_all, fields(function_based = protocol.is_function_based()))]
pub async fn run_task(
    protocol: &dyn TurnProtocol,
    ctx: &mut TurnContext<'_>,
    input: &str,
    limits: TaskLimits,
    cancel: &CancellationToken,
) -> Result<TaskOutcome> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(TaskOutcome {
            turns: 0,
            stop: TaskStop::NoInput,
        });
    }

    let mut next_input = input.to_string();
    let mut last_code = String::new();
    let mut turns = 0;
    loop {
        if limits.max_turns > 0 && turns >= limits.max_turns {
            warn!(max_turns = limits.max_turns, "turn limit reached");
            ctx.host
                .status(&format!("Turn limit of {} reached.", limits.max_turns))
                .await;
            return Ok(TaskOutcome {
                turns,
                stop: TaskStop::MaxTurns,
            });
        }
        turns += 1;

        let turn_cancel = cancel.child_token();
        let request = TurnRequest {
            input: &next_input,
            mode: limits.mode,
            previous_code: &last_code,
        };
        let turn = match protocol.send_turn(ctx, request, &turn_cancel).await {
            Ok(turn) => turn,
            Err(err) if is_cancelled(&err) => {
                info!(turns, "task cancelled");
                return Ok(TaskOutcome {
                    turns,
                    stop: TaskStop::Cancelled,
                });
            }
            Err(err) => return Err(err),
        };

        match decide(&turn, &last_code, protocol.is_function_based()) {
            Decision::Stop(reason) => {
                info!(turns, ?reason, "task finished");
                return Ok(TaskOutcome {
                    turns,
                    stop: reason.into(),
                });
            }
            Decision::Continue {
                follow_up,
                next_input: prompt,
                remember_code,
            } => {
                debug!(follow_up = follow_up.name(), "continuing task");
                if let Some(code) = remember_code {
                    last_code = code;
                }
                next_input = prompt;
            }
        }
    }
}
