//! Context-window management.
//!
//! Keeps the estimated prompt size within `max_tokens - response_reserve`
//! before the request is prepared. Token counts use a character-based
//! approximation (~4 chars per token), which is deliberately conservative;
//! exact tokenizers are provider-specific and out of scope.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Message, Role};

/// Default tokens reserved for the model's response.
pub const DEFAULT_RESPONSE_RESERVE: u32 = 512;

/// How many recent turns the `Smart` strategy preserves.
const SMART_PRESERVED_TURNS: usize = 10;

/// Trimming strategy when the conversation exceeds the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Drop oldest messages until the conversation fits.
    Truncate,
    /// Keep the system message and as many recent messages as fit.
    SlidingWindow,
    /// Keep the system message and the last 10 turns; the final user
    /// message is never dropped.
    Smart,
}

/// Context-management settings for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Trimming strategy.
    pub strategy: ContextStrategy,
    /// Total window budget in tokens (prompt + response reserve).
    pub max_tokens: u32,
    /// Tokens reserved for the response.
    pub response_reserve: u32,
}

impl ContextOptions {
    /// Settings with the given window and the default reserve.
    pub fn new(strategy: ContextStrategy, max_tokens: u32) -> Self {
        Self {
            strategy,
            max_tokens,
            response_reserve: DEFAULT_RESPONSE_RESERVE,
        }
    }

    fn budget(&self) -> u32 {
        self.max_tokens.saturating_sub(self.response_reserve)
    }
}

/// Estimate the token count of a message (~4 chars per token, rounded up,
/// plus a small per-message framing overhead).
pub fn estimate_tokens(message: &Message) -> u32 {
    let chars = message.content.as_text().chars().count() as u32;
    chars.div_ceil(4) + 4
}

/// Estimated token total for a conversation.
pub fn estimate_conversation(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_tokens).sum()
}

/// Trim `messages` to fit the budget according to the strategy.
///
/// Returns the messages unchanged when they already fit.
pub fn apply(messages: Vec<Message>, options: &ContextOptions) -> Vec<Message> {
    let budget = options.budget();
    if estimate_conversation(&messages) <= budget {
        return messages;
    }

    let before = messages.len();
    let trimmed = match options.strategy {
        ContextStrategy::Truncate => truncate(messages, budget),
        ContextStrategy::SlidingWindow => sliding_window(messages, budget),
        ContextStrategy::Smart => smart(messages, budget),
    };
    debug!(
        strategy = ?options.strategy,
        dropped = before - trimmed.len(),
        "trimmed conversation to fit context window"
    );
    trimmed
}

/// Drop oldest messages first until the conversation fits.
fn truncate(mut messages: Vec<Message>, budget: u32) -> Vec<Message> {
    while messages.len() > 1 && estimate_conversation(&messages) > budget {
        messages.remove(0);
    }
    messages
}

/// Keep the leading system message, then take the most recent messages
/// that fit the remaining budget.
fn sliding_window(messages: Vec<Message>, budget: u32) -> Vec<Message> {
    let system: Vec<Message> = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .cloned()
        .collect();
    let rest: Vec<Message> = messages
        .into_iter()
        .skip_while(|m| m.role == Role::System)
        .collect();

    let mut remaining = budget.saturating_sub(estimate_conversation(&system));
    let mut kept_rev = Vec::new();
    for msg in rest.into_iter().rev() {
        let tokens = estimate_tokens(&msg);
        if tokens > remaining && !kept_rev.is_empty() {
            break;
        }
        remaining = remaining.saturating_sub(tokens);
        kept_rev.push(msg);
    }

    let mut result = system;
    result.extend(kept_rev.into_iter().rev());
    result
}

/// Preserve the system message and the last `SMART_PRESERVED_TURNS`
/// messages; the final user message is always kept. Older messages are
/// dropped oldest-first until the conversation fits.
fn smart(messages: Vec<Message>, budget: u32) -> Vec<Message> {
    let system: Vec<Message> = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .cloned()
        .collect();
    let mut rest: Vec<Message> = messages
        .into_iter()
        .skip_while(|m| m.role == Role::System)
        .collect();

    // Never drop below the preserved tail (or the last user turn).
    let preserved = rest.len().min(SMART_PRESERVED_TURNS).max(1);
    while rest.len() > preserved {
        let candidate: u32 = estimate_conversation(&system) + estimate_conversation(&rest);
        if candidate <= budget {
            break;
        }
        rest.remove(0);
    }

    let mut result = system;
    result.extend(rest);
    result
}
