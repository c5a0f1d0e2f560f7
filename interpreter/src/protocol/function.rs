//! Function-calling style: code travels as `execute` tool calls.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::harness::Language;
use crate::core::tool_calls::{EXECUTE_TOOL, parse_execute_arguments};
use crate::core::types::{ChatMessage, ToolCall, TurnResult, is_cancelled};
use crate::protocol::{
    RESPONSE_CANCELLED, RunOutcome, TurnContext, TurnProtocol, TurnRequest, apply_outcome,
    cancelled_turn, confirm_and_run,
};

/// Declaration of the single `execute(language, code)` tool.
pub fn execute_tool_declaration() -> Value {
    let languages: Vec<&str> = Language::ALL.iter().map(|language| language.id()).collect();
    json!({
        "type": "function",
        "function": {
            "name": EXECUTE_TOOL,
            "description": "Executes code on the user's machine and returns the output.",
            "parameters": {
                "type": "object",
                "properties": {
                    "language": {
                        "type": "string",
                        "enum": languages,
                        "description": "The programming language of the code.",
                    },
                    "code": {
                        "type": "string",
                        "description": "The code to execute.",
                    },
                },
                "required": ["language", "code"],
            },
        },
    })
}

/// Offers the `execute` tool and runs every call the model makes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionProtocol;

#[async_trait]
impl TurnProtocol for FunctionProtocol {
    fn is_function_based(&self) -> bool {
        true
    }

    #[instrument(skip_all, name = "function_turn")]
    async fn send_turn(
        &self,
        ctx: &mut TurnContext<'_>,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TurnResult> {
        let tools = [execute_tool_declaration()];
        let reply = match ctx
            .chat
            .send(request.input, &tools, request.mode, ctx.host, cancel)
            .await
        {
            Ok(reply) => reply,
            Err(err) if is_cancelled(&err) => {
                ctx.host.render_full(RESPONSE_CANCELLED).await?;
                return Ok(cancelled_turn());
            }
            Err(err) => return Err(err),
        };

        let mut turn = TurnResult {
            response_text: reply.content.clone(),
            ..TurnResult::default()
        };
        if reply.tool_calls.is_empty() {
            ctx.chat.push(ChatMessage::assistant(reply.content));
            debug!("reply carried no tool calls");
            return Ok(turn);
        }
        ctx.chat.push(ChatMessage::assistant_with_calls(
            reply.content,
            reply.tool_calls.clone(),
        ));

        // Every call id gets exactly one tool message, even after a stop.
        let mut stop_text: Option<String> = None;
        for call in &reply.tool_calls {
            if let Some(text) = &stop_text {
                ctx.chat.push(ChatMessage::tool(&call.id, text.as_str()));
                continue;
            }
            let text = handle_call(ctx, call, &request, &mut turn, cancel).await?;
            if turn.was_cancelled || (turn.code_given && !turn.did_user_run) {
                stop_text = Some(text.clone());
            }
            ctx.chat.push(ChatMessage::tool(&call.id, text));
        }
        Ok(turn)
    }
}

async fn handle_call(
    ctx: &mut TurnContext<'_>,
    call: &ToolCall,
    request: &TurnRequest<'_>,
    turn: &mut TurnResult,
    cancel: &CancellationToken,
) -> Result<String> {
    if call.name != EXECUTE_TOOL {
        warn!(tool = %call.name, "model called an unknown tool");
        turn.had_error = true;
        return Ok(format!("Unknown tool `{}`. Only `{EXECUTE_TOOL}` is available.", call.name));
    }
    let args = match parse_execute_arguments(&call.arguments) {
        Ok(args) => args,
        Err(err) => {
            warn!(error = %err, "malformed execute arguments");
            turn.had_error = true;
            return Ok(format!("Invalid arguments for `{EXECUTE_TOOL}`: {err:#}"));
        }
    };

    turn.code_given = true;
    turn.did_user_run = false;
    turn.had_error = false;
    turn.code = Some(args.code.clone());
    turn.language = Some(args.language.clone());
    ctx.host
        .render_full(&format!("```{}\n{}\n```", args.language, args.code))
        .await?;

    let outcome = confirm_and_run(ctx, &args.language, &args.code, request.previous_code, cancel).await?;
    if outcome == RunOutcome::Repeated {
        debug!(id = %call.id, "repeated code answered without running");
    }
    Ok(apply_outcome(ctx.chat, turn, &outcome))
}
