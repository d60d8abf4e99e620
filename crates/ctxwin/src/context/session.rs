//! Per-conversation orchestration of the context pipeline.
//!
//! A [`ContextSession`] owns the state that has to survive between turns
//! (the flush clock) and within a turn (recorded tool output), and runs the
//! per-turn sequence in a fixed order:
//!
//! 1. reset the reply deduplicator;
//! 2. ask the flush scheduler whether the model should save memories first;
//! 3. compact history if it has outgrown its share of the window;
//! 4. account for the resulting budget.
//!
//! Sessions share nothing with each other. A host running many conversations
//! keeps one session per conversation.

use crate::Message;
use crate::context::budget::{TokenBudget, calculate_budget_with};
use crate::context::compaction::{CompactionLadder, CompactionReport};
use crate::context::config::CompactionConfig;
use crate::context::dedup::{DeduplicatorConfig, ReplyDeduplicator};
use crate::context::flush::{FLUSH_INSTRUCTION, FlushConfig, FlushScheduler, FlushState};
use crate::context::summarizer::TextSummarizer;
use crate::context::tokens::TokenEstimator;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the host needs to issue the next model call.
#[derive(Debug, Clone)]
pub struct TurnPlan {
    /// History to send, compacted if needed.
    pub messages: Vec<Arc<Message>>,
    /// Inject as a system note for this turn when set.
    pub flush_instruction: Option<&'static str>,
    /// Budget of `messages` after compaction.
    pub budget: TokenBudget,
    /// Present when the history was rewritten.
    pub compaction: Option<CompactionReport>,
}

impl TurnPlan {
    pub fn was_compacted(&self) -> bool {
        self.compaction.is_some()
    }
}

/// Context management state for one conversation.
#[derive(Debug, Clone)]
pub struct ContextSession {
    context_window: i64,
    config: CompactionConfig,
    estimator: TokenEstimator,
    ladder: CompactionLadder,
    flush: FlushScheduler,
    dedup: ReplyDeduplicator,
}

impl ContextSession {
    /// Session with default settings for a model with `context_window` tokens.
    pub fn new(context_window: i64) -> Self {
        Self::with_config(context_window, CompactionConfig::default())
    }

    /// Session with explicit compaction settings. Out-of-range fractions are
    /// replaced with defaults.
    pub fn with_config(context_window: i64, config: CompactionConfig) -> Self {
        let config = config.sanitized();
        Self {
            context_window,
            ladder: CompactionLadder::new(config.clone()),
            config,
            estimator: TokenEstimator::default(),
            flush: FlushScheduler::new(),
            dedup: ReplyDeduplicator::new(),
        }
    }

    /// Use `estimator` for every count the session makes.
    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.ladder = self.ladder.with_estimator(estimator.clone());
        self.flush = self.flush.with_estimator(estimator.clone());
        self.estimator = estimator;
        self
    }

    pub fn with_flush_config(mut self, config: FlushConfig) -> Self {
        self.flush = self.flush.with_config(config);
        self
    }

    /// Resume the flush clock from a persisted [`FlushState`].
    pub fn with_flush_state(mut self, state: FlushState) -> Self {
        self.flush = self.flush.with_state(state);
        self
    }

    pub fn with_dedup_config(mut self, config: DeduplicatorConfig) -> Self {
        self.dedup = ReplyDeduplicator::with_config(config);
        self
    }

    pub fn context_window(&self) -> i64 {
        self.context_window
    }

    /// Switch models mid-conversation.
    pub fn set_context_window(&mut self, context_window: i64) {
        self.context_window = context_window;
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Current flush clock, for persisting between process runs.
    pub fn flush_state(&self) -> FlushState {
        self.flush.state()
    }

    pub fn deduplicator(&self) -> &ReplyDeduplicator {
        &self.dedup
    }

    /// Prepare history for the next model call.
    ///
    /// The flush check runs against the history as given, before compaction
    /// can discard what the model might want to save. `now` is epoch
    /// milliseconds and becomes the last flush time when a flush is signalled.
    pub async fn prepare_turn(
        &mut self,
        messages: &[Arc<Message>],
        system_prompt: &str,
        lorebook: &str,
        summarizer: Option<&dyn TextSummarizer>,
        now: i64,
    ) -> TurnPlan {
        self.dedup.reset();

        let flush_instruction = self
            .flush
            .check(messages, self.context_window, &self.config, now)
            .then_some(FLUSH_INSTRUCTION);
        if flush_instruction.is_some() {
            info!("Requesting memory flush before compaction");
        }

        let (messages, compaction) = match self
            .ladder
            .compact(messages, self.context_window, system_prompt, summarizer)
            .await
        {
            Some(compacted) => (compacted.messages, Some(compacted.report)),
            None => (messages.to_vec(), None),
        };

        let budget = calculate_budget_with(
            &self.estimator,
            self.context_window,
            system_prompt,
            lorebook,
            &messages,
            &self.config,
        );
        debug!("{}", budget.to_log_string());

        TurnPlan {
            messages,
            flush_instruction,
            budget,
            compaction,
        }
    }

    /// Record a tool result produced during the current turn.
    pub fn record_tool_output(&mut self, text: &str) {
        self.dedup.record_tool_output(text);
    }

    /// Filter the final assistant reply against this turn's tool output.
    pub fn finish_reply(&self, text: &str) -> String {
        self.dedup.filter_reply(text)
    }
}
