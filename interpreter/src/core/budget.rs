//! History budgeting against a model's token limit.
//!
//! Costs follow the chat-completions accounting: every message pays a fixed
//! per-message overhead plus the tokens of its role and content (and name,
//! tool call id, tool calls), and every request pays 3 tokens to prime the
//! reply.

use anyhow::{Context, Result};
use thiserror::Error;
use tiktoken_rs::CoreBPE;

use crate::core::model_info::{Encoding, ModelProfile};
use crate::core::types::{ChatMessage, Role};

/// Tokens every request spends priming the assistant reply.
pub const REPLY_PRIMING_TOKENS: usize = 3;

/// Appended to tool output cut down to fit the budget.
pub const TRUNCATION_NOTICE: &str = "\n...Output truncated.";

/// Counts tokens of a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Counter backed by the model's BPE encoding.
pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    pub fn for_encoding(encoding: Encoding) -> Result<Self> {
        let bpe = match encoding {
            Encoding::Cl100kBase => tiktoken_rs::cl100k_base(),
            Encoding::O200kBase => tiktoken_rs::o200k_base(),
        }
        .with_context(|| format!("load tokenizer {encoding:?}"))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// The combination of prompt and input cannot fit the model's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "The input is too long to get a proper response without exceeding the token limit ({limit}).\nPlease reduce the input and try again."
)]
pub struct InputTooLong {
    pub limit: usize,
}

/// Limits the budget is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub token_limit: usize,
    pub response_allowance: usize,
    pub tokens_per_message: i64,
    pub tokens_per_name: i64,
}

impl BudgetLimits {
    pub fn new(profile: &ModelProfile, response_allowance: usize) -> Self {
        Self {
            token_limit: profile.token_limit,
            response_allowance,
            tokens_per_message: profile.tokens_per_message,
            tokens_per_name: profile.tokens_per_name,
        }
    }

    fn fits(&self, cost: usize) -> bool {
        cost + self.response_allowance < self.token_limit
    }
}

/// Token cost of one message, without reply priming.
pub fn message_cost(counter: &dyn TokenCounter, limits: &BudgetLimits, message: &ChatMessage) -> usize {
    let mut cost = limits.tokens_per_message;
    cost += counter.count(message.role.as_str()) as i64;
    cost += counter.count(&message.content) as i64;
    if let Some(name) = &message.name {
        cost += limits.tokens_per_name + counter.count(name) as i64;
    }
    if let Some(id) = &message.tool_call_id {
        cost += counter.count(id) as i64;
    }
    for call in &message.tool_calls {
        cost += (counter.count(&call.id) + counter.count(&call.name) + counter.count(&call.arguments))
            as i64;
    }
    cost.max(0) as usize
}

/// Token cost of sending `messages` as one request.
pub fn request_cost(counter: &dyn TokenCounter, limits: &BudgetLimits, messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|message| message_cost(counter, limits, message))
        .sum::<usize>()
        + REPLY_PRIMING_TOKENS
}

/// Append `candidate` to `history`, evicting the oldest non-system messages
/// until the request plus the response allowance fits the limit.
///
/// Fails without touching `history` when `candidate` alone cannot fit. If the
/// evictions reach the candidate itself, the candidate is removed again and
/// the call fails; messages evicted before that stay evicted.
pub fn reduce(
    history: &mut Vec<ChatMessage>,
    candidate: ChatMessage,
    counter: &dyn TokenCounter,
    limits: &BudgetLimits,
) -> Result<(), InputTooLong> {
    let too_long = InputTooLong {
        limit: limits.token_limit,
    };
    if !limits.fits(request_cost(counter, limits, std::slice::from_ref(&candidate))) {
        return Err(too_long);
    }

    history.push(candidate);
    let protected = history
        .iter()
        .take_while(|message| message.role == Role::System)
        .count();

    while !limits.fits(request_cost(counter, limits, history)) {
        let candidate_index = history.len() - 1;
        if protected >= candidate_index {
            history.pop();
            return Err(too_long);
        }
        let removed = history.remove(protected);
        if !removed.tool_calls.is_empty() {
            // Tool answers are only valid after the call that asked for them.
            while protected < history.len() - 1 && history[protected].role == Role::Tool {
                history.remove(protected);
            }
        }
    }
    Ok(())
}

/// Halve `text` until it plus [`TRUNCATION_NOTICE`] costs fewer than
/// `max_tokens`. Text already under the limit is returned unchanged.
pub fn truncate_to_tokens(counter: &dyn TokenCounter, text: &str, max_tokens: usize) -> String {
    if counter.count(text) < max_tokens {
        return text.to_string();
    }
    let mut reduced = text;
    loop {
        let mut cut = reduced.len() / 2;
        while !reduced.is_char_boundary(cut) {
            cut -= 1;
        }
        reduced = &reduced[..cut];
        let candidate = format!("{reduced}{TRUNCATION_NOTICE}");
        if reduced.is_empty() || counter.count(&candidate) < max_tokens {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ToolCall;
    use crate::test_support::WordCounter;

    fn limits(token_limit: usize, response_allowance: usize) -> BudgetLimits {
        BudgetLimits {
            token_limit,
            response_allowance,
            tokens_per_message: 3,
            tokens_per_name: 1,
        }
    }

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    #[test]
    fn message_cost_counts_overhead_role_and_content() {
        let cost = message_cost(&WordCounter, &limits(100, 0), &ChatMessage::user("a b c"));
        // 3 per message + 1 role + 3 content
        assert_eq!(cost, 7);
    }

    #[test]
    fn message_cost_counts_tool_calls_and_ids() {
        let assistant = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCall {
                id: "id".to_string(),
                name: "execute".to_string(),
                arguments: "a b".to_string(),
            }],
        );
        assert_eq!(message_cost(&WordCounter, &limits(100, 0), &assistant), 3 + 1 + 4);
        let tool = ChatMessage::tool("id", "out");
        assert_eq!(message_cost(&WordCounter, &limits(100, 0), &tool), 3 + 1 + 1 + 1);
    }

    /// Verifies an oversized candidate fails before any mutation.
    #[test]
    fn oversized_candidate_fails_without_mutating_history() {
        let mut history = vec![ChatMessage::system("sys"), ChatMessage::user("old")];
        let before = history.clone();
        let err = reduce(&mut history, ChatMessage::user(words(50)), &WordCounter, &limits(60, 10))
            .expect_err("too long");
        assert_eq!(err, InputTooLong { limit: 60 });
        assert_eq!(history, before);
        assert!(err.to_string().contains("token limit (60)"));
    }

    #[test]
    fn evicts_oldest_non_system_messages_until_it_fits() {
        let budget = limits(40, 10);
        let mut history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user(words(5)),
            ChatMessage::assistant(words(5)),
        ];
        reduce(&mut history, ChatMessage::user(words(5)), &WordCounter, &budget).expect("fits");

        assert_eq!(history[0], ChatMessage::system("sys"));
        assert_eq!(history.last(), Some(&ChatMessage::user(words(5))));
        assert!(request_cost(&WordCounter, &budget, &history) + 10 < 40);
        assert!(history.len() < 4);
    }

    #[test]
    fn all_leading_system_messages_survive() {
        let budget = limits(45, 5);
        let mut history = vec![
            ChatMessage::system("base"),
            ChatMessage::system("rules"),
            ChatMessage::user(words(10)),
        ];
        reduce(&mut history, ChatMessage::user(words(10)), &WordCounter, &budget).expect("fits");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[1].role, Role::System);
    }

    #[test]
    fn evicting_a_tool_call_evicts_its_answers() {
        let budget = limits(50, 5);
        let mut history = vec![
            ChatMessage::system("sys"),
            ChatMessage::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "c1".to_string(),
                    name: "execute".to_string(),
                    arguments: words(5),
                }],
            ),
            ChatMessage::tool("c1", words(5)),
            ChatMessage::assistant(words(2)),
        ];
        reduce(&mut history, ChatMessage::user(words(20)), &WordCounter, &budget).expect("fits");
        assert!(history.iter().all(|message| message.role != Role::Tool));
    }

    #[test]
    fn fails_when_system_prompt_and_candidate_cannot_fit() {
        let budget = limits(40, 5);
        let mut history = vec![ChatMessage::system(words(20)), ChatMessage::user("old")];
        let err = reduce(&mut history, ChatMessage::user(words(10)), &WordCounter, &budget)
            .expect_err("too long");
        assert_eq!(err.limit, 40);
        assert_eq!(history, vec![ChatMessage::system(words(20))]);
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate_to_tokens(&WordCounter, "a b", 10), "a b");
    }

    #[test]
    fn truncate_halves_until_notice_fits() {
        let text = words(40);
        let truncated = truncate_to_tokens(&WordCounter, &text, 15);
        assert!(truncated.ends_with(TRUNCATION_NOTICE));
        assert!(WordCounter.count(&truncated) < 15);
        assert!(truncated.len() < text.len());
    }
}
