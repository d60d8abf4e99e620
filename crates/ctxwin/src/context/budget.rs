//! Token budget accounting: how a context window is split between the system
//! prompt, injected lorebook text, message history, and the output reserve.
//!
//! Every field of a [`TokenBudget`] is a non-negative estimated token count.
//! Nonsensical inputs (zero or negative windows) degrade to an empty
//! `available` value rather than an error.

use crate::Message;
use crate::context::config::{CompactionConfig, clamp_window};
use crate::context::tokens::TokenEstimator;
use serde::Serialize;
use std::sync::Arc;

/// Separator between components in [`format_budget`] output.
const BUDGET_SEPARATOR: &str = " · ";

/// Breakdown of context window usage for one request.
///
/// `available` is always `max(0, context_window - (system_prompt + lorebook
/// + history + output_reserve))`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    pub context_window: usize,
    pub system_prompt: usize,
    pub lorebook: usize,
    pub history: usize,
    pub output_reserve: usize,
    pub available: usize,
}

impl TokenBudget {
    /// Tokens consumed by input: system prompt, lorebook, and history.
    pub fn input_tokens(&self) -> usize {
        self.system_prompt + self.lorebook + self.history
    }

    /// Input usage as a percentage of the window, clamped to 0..=100.
    pub fn usage_percent(&self) -> u8 {
        token_usage_percent(
            i64::try_from(self.input_tokens()).unwrap_or(i64::MAX),
            i64::try_from(self.context_window).unwrap_or(i64::MAX),
        )
    }

    /// Whether input plus the output reserve exceeds the window.
    pub fn is_over(&self) -> bool {
        self.input_tokens() + self.output_reserve > self.context_window
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({}% of {}), {} available",
            self.input_tokens(),
            self.usage_percent(),
            self.context_window,
            self.available,
        )
    }
}

/// Compute the budget breakdown with the heuristic estimator.
pub fn calculate_budget(
    context_window: i64,
    system_prompt: &str,
    auxiliary: &str,
    messages: &[Arc<Message>],
    config: &CompactionConfig,
) -> TokenBudget {
    calculate_budget_with(
        &TokenEstimator::default(),
        context_window,
        system_prompt,
        auxiliary,
        messages,
        config,
    )
}

/// Compute the budget breakdown with a specific estimator.
pub fn calculate_budget_with(
    estimator: &TokenEstimator,
    context_window: i64,
    system_prompt: &str,
    auxiliary: &str,
    messages: &[Arc<Message>],
    config: &CompactionConfig,
) -> TokenBudget {
    let context_window = clamp_window(context_window);
    let system_prompt = estimator.estimate(system_prompt);
    let lorebook = estimator.estimate(auxiliary);
    let history = estimator.estimate_messages(messages);
    let output_reserve = config.output_reserve_tokens(context_window);

    let used = system_prompt + lorebook + history + output_reserve;
    TokenBudget {
        context_window,
        system_prompt,
        lorebook,
        history,
        output_reserve,
        available: context_window.saturating_sub(used),
    }
}

/// Render non-zero budget components, e.g.
/// `"system 1.2K · history 3.4K · reserve 19.2K · available 104.2K"`.
pub fn format_budget(budget: &TokenBudget) -> String {
    let parts: Vec<String> = [
        ("system", budget.system_prompt),
        ("lorebook", budget.lorebook),
        ("history", budget.history),
        ("reserve", budget.output_reserve),
        ("available", budget.available),
    ]
    .iter()
    .filter(|(_, tokens)| *tokens > 0)
    .map(|(label, tokens)| format!("{label} {}", format_token_count(*tokens)))
    .collect();
    parts.join(BUDGET_SEPARATOR)
}

/// Compact display for a token count: `500`, `1.5K`, `128.0K`.
pub fn format_token_count(n: usize) -> String {
    if n < 1000 {
        n.to_string()
    } else {
        format!("{:.1}K", n as f64 / 1000.0)
    }
}

/// `used / context_window` as a whole percentage clamped to 0..=100.
///
/// Returns 0 for non-positive windows or usage.
pub fn token_usage_percent(used: i64, context_window: i64) -> u8 {
    if context_window <= 0 || used <= 0 {
        return 0;
    }
    let pct = (used as f64 / context_window as f64 * 100.0).round();
    pct.min(100.0) as u8
}
