//! Pre-compaction memory flush.
//!
//! Shortly before history crosses the compaction threshold, the model gets one
//! chance to write down anything worth keeping. [`FlushScheduler`] decides
//! when that chance is due; the host injects [`FLUSH_INSTRUCTION`] and lets
//! the model call its memory-write tool.
//!
//! The line sits [`FLUSH_OFFSET_TOKENS`] below the compaction threshold, and a
//! cooldown keeps the instruction from repeating every turn while usage
//! hovers above it.

use crate::Message;
use crate::context::config::{CompactionConfig, clamp_window};
use crate::context::tokens::TokenEstimator;
use crate::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Tokens below the compaction threshold at which a flush becomes due.
pub const FLUSH_OFFSET_TOKENS: usize = 4_000;

/// Minimum gap between flushes, measured against message timestamps.
/// Empirically tuned.
pub const FLUSH_COOLDOWN_MS: i64 = 60_000;

/// System instruction injected into the turn when a flush is due.
pub const FLUSH_INSTRUCTION: &str = "The conversation is about to be compacted and older \
messages will be summarized. Before continuing, use your memory-write tool to save any \
important facts, preferences, or commitments from this conversation that are not yet \
stored. Then continue the conversation normally.";

/// Session-owned flush bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushState {
    /// Epoch milliseconds of the last signalled flush; 0 if never.
    pub last_flush_at: i64,
}

/// Tunables for the flush gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub offset_tokens: usize,
    pub cooldown_ms: i64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            offset_tokens: FLUSH_OFFSET_TOKENS,
            cooldown_ms: FLUSH_COOLDOWN_MS,
        }
    }
}

impl FlushConfig {
    pub fn with_offset_tokens(mut self, tokens: usize) -> Self {
        self.offset_tokens = tokens;
        self
    }

    pub fn with_cooldown_ms(mut self, ms: i64) -> Self {
        self.cooldown_ms = ms;
        self
    }
}

/// Stateless flush check with the default offset and cooldown.
///
/// `last_flush_at` is compared against the newest message timestamp, or the
/// wall clock when no message carries one.
pub fn should_flush(
    messages: &[Arc<Message>],
    context_window: i64,
    last_flush_at: i64,
    config: &CompactionConfig,
) -> bool {
    flush_due(
        &TokenEstimator::default(),
        &FlushConfig::default(),
        messages,
        context_window,
        last_flush_at,
        config,
    )
}

fn flush_due(
    estimator: &TokenEstimator,
    flush: &FlushConfig,
    messages: &[Arc<Message>],
    context_window: i64,
    last_flush_at: i64,
    config: &CompactionConfig,
) -> bool {
    if config.is_within_recency_window(messages.len()) {
        return false;
    }

    let flush_line = config
        .history_threshold_tokens(clamp_window(context_window))
        .saturating_sub(flush.offset_tokens);
    let history = estimator.estimate_messages(messages);
    if history < flush_line {
        trace!("Flush not due: ~{history} history tokens below flush line {flush_line}");
        return false;
    }

    let latest = latest_timestamp(messages).unwrap_or_else(now_millis);
    let due = last_flush_at < latest.saturating_sub(flush.cooldown_ms);
    if !due {
        debug!(
            "Flush line {flush_line} crossed but cooling down (last flush {last_flush_at}, latest message {latest})"
        );
    }
    due
}

fn latest_timestamp(messages: &[Arc<Message>]) -> Option<i64> {
    messages.iter().rev().find_map(|m| m.timestamp)
}

/// Stateful flush gate for one conversation.
///
/// ```ignore
/// let mut flush = FlushScheduler::new();
/// if flush.check(&history, 128_000, &config, now_ms) {
///     inject_system_note(FLUSH_INSTRUCTION);
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlushScheduler {
    state: FlushState,
    config: FlushConfig,
    estimator: TokenEstimator,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted state.
    pub fn from_state(state: FlushState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: FlushConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_state(mut self, state: FlushState) -> Self {
        self.state = state;
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    /// Whether a flush is due, without touching state.
    pub fn should_flush(
        &self,
        messages: &[Arc<Message>],
        context_window: i64,
        config: &CompactionConfig,
    ) -> bool {
        flush_due(
            &self.estimator,
            &self.config,
            messages,
            context_window,
            self.state.last_flush_at,
            config,
        )
    }

    /// Like [`should_flush()`](Self::should_flush), but records `now` as the
    /// last flush when it returns `true`.
    pub fn check(
        &mut self,
        messages: &[Arc<Message>],
        context_window: i64,
        config: &CompactionConfig,
        now: i64,
    ) -> bool {
        let due = self.should_flush(messages, context_window, config);
        if due {
            debug!("Memory flush due at {now}");
            self.state.last_flush_at = now;
        }
        due
    }
}
