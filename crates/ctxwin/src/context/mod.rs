//! Context window management: estimation, budgets, compaction, flush, dedup.
//!
//! The context window is the scarcest resource in a long conversation. This
//! module keeps history inside it in layers:
//!
//! 1. **[`tokens`]**: [`TokenEstimator`] counts tokens with a CJK-aware
//!    heuristic, or a precise [`Tokenizer`](tokens::Tokenizer) when one is
//!    plugged in.
//!
//! 2. **[`budget`]**: [`TokenBudget`] splits the window between system prompt,
//!    lorebook, history, the output reserve, and what is left.
//!
//! 3. **[`compaction`]**: the [`CompactionLadder`] shrinks history in three
//!    rungs: truncate stale tool output, drop stale reasoning, then summarize
//!    the middle through a [`TextSummarizer`] or a local fallback.
//!
//! 4. **[`flush`]**: [`FlushScheduler`] asks the model to save memories just
//!    before compaction would discard them.
//!
//! 5. **[`dedup`]**: [`ReplyDeduplicator`] keeps the final reply from echoing
//!    tool output.
//!
//! [`ContextSession`] runs all of them once per turn for one conversation.

pub mod budget;
pub mod compaction;
pub mod config;
pub mod dedup;
pub mod flush;
pub mod session;
pub mod summarizer;
pub mod tokens;

// Re-export commonly used items at the module level.
pub use budget::{
    TokenBudget, calculate_budget, format_budget, format_token_count, token_usage_percent,
};
pub use compaction::{
    CompactionLadder, CompactionReport, CompactionStrategy, Compacted, compact_messages,
};
pub use config::CompactionConfig;
pub use dedup::{DeduplicatorConfig, ReplyDeduplicator};
pub use flush::{FLUSH_INSTRUCTION, FlushConfig, FlushScheduler, FlushState, should_flush};
pub use session::{ContextSession, TurnPlan};
pub use summarizer::{FnSummarizer, SummaryFuture, TextSummarizer};
pub use tokens::{
    TokenEstimator, estimate_message_tokens, estimate_messages_tokens, estimate_tokens,
};
