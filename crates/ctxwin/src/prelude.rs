//! Convenience re-exports for common `ctxwin` types.
//!
//! Meant to be glob-imported by chat hosts:
//!
//! ```ignore
//! use ctxwin::prelude::*;
//! ```
//!
//! This pulls in the message model, the per-turn [`ContextSession`], and the
//! summarizer seam. The individual rungs of the compaction ladder and the
//! normalization helpers are left out; import those from their modules.

// ── Message model ───────────────────────────────────────────────────
pub use crate::{ContentBlock, Message, MessageRole, Provenance, Usage, now_millis};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    CompactionConfig, CompactionLadder, CompactionReport, ContextSession, DeduplicatorConfig,
    FLUSH_INSTRUCTION, FlushConfig, FlushScheduler, FlushState, ReplyDeduplicator, TokenBudget,
    TokenEstimator, TurnPlan, format_budget,
};

// ── Summarization ───────────────────────────────────────────────────
pub use crate::context::{FnSummarizer, SummaryFuture, TextSummarizer};
