//! Plain-text calling style: code travels in fenced blocks.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::core::code_block::extract_code_block;
use crate::core::types::{ChatMessage, TurnResult, is_cancelled};
use crate::protocol::{
    RESPONSE_CANCELLED, RunOutcome, TurnContext, TurnProtocol, TurnRequest, apply_outcome,
    cancelled_turn, confirm_and_run,
};

/// Looks for the first fenced block tagged with a supported language.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextProtocol;

#[async_trait]
impl TurnProtocol for TextProtocol {
    fn is_function_based(&self) -> bool {
        false
    }

    #[instrument(skip_all, name = "text_turn")]
    async fn send_turn(
        &self,
        ctx: &mut TurnContext<'_>,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TurnResult> {
        let reply = match ctx
            .chat
            .send(request.input, &[], request.mode, ctx.host, cancel)
            .await
        {
            Ok(reply) => reply,
            Err(err) if is_cancelled(&err) => {
                ctx.host.render_full(RESPONSE_CANCELLED).await?;
                return Ok(cancelled_turn());
            }
            Err(err) => return Err(err),
        };
        ctx.chat.push(ChatMessage::assistant(reply.content.clone()));

        let mut turn = TurnResult {
            response_text: reply.content.clone(),
            ..TurnResult::default()
        };
        let Some(block) = extract_code_block(&reply.content) else {
            debug!("reply carried no runnable code");
            return Ok(turn);
        };
        turn.code_given = true;
        turn.code = Some(block.code.clone());
        turn.language = Some(block.language.id().to_string());

        let outcome = confirm_and_run(
            ctx,
            block.language.id(),
            &block.code,
            request.previous_code,
            cancel,
        )
        .await?;
        let text = apply_outcome(ctx.chat, &mut turn, &outcome);
        if outcome != RunOutcome::Repeated {
            ctx.chat.push(ChatMessage::user(text));
        }
        Ok(turn)
    }
}
