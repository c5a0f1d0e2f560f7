//! Orchestrator decision table for one finished turn.

use crate::core::followup::FollowUp;
use crate::core::types::TurnResult;

/// Why a task stopped without another model turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The turn was cancelled by the user (model call, confirmation or run).
    Cancelled,
    /// The model replied without code.
    NoCode,
    /// The model offered code and the user chose not to run it.
    Declined,
}

/// What the orchestrator does after a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Stop(StopReason),
    Continue {
        follow_up: FollowUp,
        next_input: String,
        /// Replaces the remembered code when set.
        remember_code: Option<String>,
    },
}

/// Decide the next step from `turn`, the code of the last successful run and
/// the calling style of the active protocol.
pub fn decide(turn: &TurnResult, last_code: &str, function_based: bool) -> Decision {
    if turn.was_cancelled {
        return Decision::Stop(StopReason::Cancelled);
    }
    if !turn.code_given {
        return Decision::Stop(StopReason::NoCode);
    }
    let code = turn.code.as_deref().unwrap_or_default();
    if !last_code.is_empty() && code == last_code {
        return continue_with(FollowUp::SameError, "", None);
    }
    if !turn.did_user_run {
        return Decision::Stop(StopReason::Declined);
    }
    let output = turn.tool_response_text.as_deref().unwrap_or_default();
    let follow_up = FollowUp::after_run(turn.had_error, function_based);
    let remember = (!turn.had_error).then(|| code.to_string());
    continue_with(follow_up, output, remember)
}

fn continue_with(follow_up: FollowUp, output: &str, remember_code: Option<String>) -> Decision {
    Decision::Continue {
        follow_up,
        next_input: follow_up.render(output),
        remember_code,
    }
}
