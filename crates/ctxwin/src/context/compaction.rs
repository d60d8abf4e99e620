//! Layered history compaction: lossless-ish first, lossy last.
//!
//! When history outgrows its share of the window, the ladder climbs one rung
//! at a time and stops as soon as the result fits:
//!
//! 1. **Truncate stale tool output.** Tool results older than the recency
//!    window are cut to [`TOOL_OUTPUT_TRUNCATE_CHARS`] characters. The model
//!    has already read them; the narrative survives.
//! 2. **Drop stale reasoning.** Old assistant `thinking` blocks are removed
//!    outright.
//! 3. **Summarize.** The first message (usually the persona anchor) and the
//!    recency window are kept verbatim; everything between becomes a single
//!    synthetic assistant message written by the injected
//!    [`TextSummarizer`], or by [`fallback_summary`] when there is none or it
//!    fails.
//!
//! The most recent `keep_recent_count` messages are never touched by any
//! rung. Input lists are never mutated: every rung returns a new list and
//! unchanged messages are shared by `Arc`.

use crate::context::config::{CompactionConfig, clamp_window};
use crate::context::summarizer::{
    TextSummarizer, build_transcript, fallback_summary, summary_header,
};
use crate::context::tokens::TokenEstimator;
use crate::{ContentBlock, Message, MessageRole, Provenance, Usage, now_millis, truncate_chars};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Stale tool output is cut to this many characters.
pub const TOOL_OUTPUT_TRUNCATE_CHARS: usize = 200;

/// Appended to tool output cut by the first rung.
pub const TRUNCATION_MARKER: &str = " [truncated]";

/// The rung that brought history back under budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    TruncateToolOutput,
    DropThinking,
    Summarize,
}

impl fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionStrategy::TruncateToolOutput => write!(f, "truncate-tool-output"),
            CompactionStrategy::DropThinking => write!(f, "drop-thinking"),
            CompactionStrategy::Summarize => write!(f, "summarize"),
        }
    }
}

/// Who wrote the synthetic summary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    /// The injected [`TextSummarizer`].
    Summarizer,
    /// The local deterministic digest.
    Fallback,
}

/// What a compaction did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub strategy: CompactionStrategy,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_before: usize,
    pub messages_after: usize,
    /// Set only when the summarize rung ran.
    pub summary: Option<SummarySource>,
}

impl CompactionReport {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let source = match self.summary {
            Some(SummarySource::Summarizer) => " (summarizer)",
            Some(SummarySource::Fallback) => " (fallback summary)",
            None => "",
        };
        format!(
            "compaction: {}{source}, ~{} -> ~{} tokens, {} -> {} messages",
            self.strategy,
            self.tokens_before,
            self.tokens_after,
            self.messages_before,
            self.messages_after,
        )
    }
}

/// A rewritten history and how it was produced.
#[derive(Debug, Clone)]
pub struct Compacted {
    pub messages: Vec<Arc<Message>>,
    pub report: CompactionReport,
}

/// The three-rung compaction ladder.
///
/// # Example
///
/// ```ignore
/// let ladder = CompactionLadder::new(CompactionConfig::default().with_keep_recent(6));
/// if let Some(compacted) = ladder
///     .compact(&history, 32_000, system_prompt, Some(&summarizer))
///     .await
/// {
///     history = compacted.messages;
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CompactionLadder {
    config: CompactionConfig,
    estimator: TokenEstimator,
}

impl CompactionLadder {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            estimator: TokenEstimator::default(),
        }
    }

    /// Count tokens with a specific estimator.
    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Token allowance for history: `floor(window × threshold)` minus the
    /// system prompt, never below zero.
    pub fn history_limit(&self, context_window: i64, system_prompt: &str) -> usize {
        self.config
            .history_threshold_tokens(clamp_window(context_window))
            .saturating_sub(self.estimator.estimate(system_prompt))
    }

    /// Whether [`compact()`](Self::compact) would rewrite `messages`.
    pub fn needs_compaction(
        &self,
        messages: &[Arc<Message>],
        context_window: i64,
        system_prompt: &str,
    ) -> bool {
        !self.config.is_within_recency_window(messages.len())
            && self.estimator.estimate_messages(messages)
                > self.history_limit(context_window, system_prompt)
    }

    /// Shrink `messages` until they fit, or return `None` when nothing needs
    /// to change.
    ///
    /// The summarizer is called at most once, and only if the first two rungs
    /// were not enough. Its failures never escape.
    pub async fn compact(
        &self,
        messages: &[Arc<Message>],
        context_window: i64,
        system_prompt: &str,
        summarizer: Option<&dyn TextSummarizer>,
    ) -> Option<Compacted> {
        let keep = self.config.keep_recent_count;
        if self.config.is_within_recency_window(messages.len()) {
            trace!(
                "Compaction skipped: {} messages fit in the recency window of {keep}",
                messages.len()
            );
            return None;
        }

        let limit = self.history_limit(context_window, system_prompt);
        let tokens_before = self.estimator.estimate_messages(messages);
        if tokens_before <= limit {
            trace!("Compaction skipped: ~{tokens_before} history tokens within limit {limit}");
            return None;
        }
        debug!(
            "History over budget: ~{tokens_before} tokens, limit {limit}, {} messages",
            messages.len()
        );

        let truncated = truncate_stale_tool_output(messages, keep);
        let tokens = self.estimator.estimate_messages(&truncated);
        if tokens <= limit {
            return Some(self.finish(
                CompactionStrategy::TruncateToolOutput,
                messages,
                truncated,
                tokens_before,
                None,
            ));
        }

        let stripped = drop_stale_thinking(&truncated, keep);
        let tokens = self.estimator.estimate_messages(&stripped);
        if tokens <= limit {
            return Some(self.finish(
                CompactionStrategy::DropThinking,
                messages,
                stripped,
                tokens_before,
                None,
            ));
        }

        let (summarized, source) = self.summarize(messages, &stripped, summarizer).await;
        Some(self.finish(
            CompactionStrategy::Summarize,
            messages,
            summarized,
            tokens_before,
            Some(source),
        ))
    }

    /// Collapse everything between the first message and the recency window.
    ///
    /// `current` is the output of the earlier rungs, so the transcript sees
    /// already-trimmed content. The first message always comes from
    /// `original`, untouched.
    async fn summarize(
        &self,
        original: &[Arc<Message>],
        current: &[Arc<Message>],
        summarizer: Option<&dyn TextSummarizer>,
    ) -> (Vec<Arc<Message>>, SummarySource) {
        let keep = self.config.keep_recent_count;
        let tail_start = current.len().saturating_sub(keep).max(1);
        let middle = current.get(1..tail_start).unwrap_or_default();

        let from_summarizer = match summarizer {
            Some(s) => self.run_summarizer(s, middle).await,
            None => None,
        };
        let (body, source) = match from_summarizer {
            Some(text) => (text, SummarySource::Summarizer),
            None => (fallback_summary(middle), SummarySource::Fallback),
        };

        let header = summary_header(middle.len());
        let body = body.trim();
        let text = if body.is_empty() {
            header
        } else {
            format!("{header}\n\n{body}")
        };

        let mut out = Vec::with_capacity(keep + 2);
        if let Some(first) = original.first() {
            out.push(Arc::clone(first));
            out.push(Arc::new(synthetic_summary(first, text)));
        }
        out.extend(original.iter().skip(tail_start).cloned());
        (out, source)
    }

    async fn run_summarizer(
        &self,
        summarizer: &dyn TextSummarizer,
        middle: &[Arc<Message>],
    ) -> Option<String> {
        let transcript = build_transcript(middle);
        let call = summarizer.summarize(&transcript);
        let result = match self.config.summarizer_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
            },
            None => call.await,
        };

        match result {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => {
                warn!("Summarizer returned an empty summary. Using fallback summary.");
                None
            }
            Err(e) => {
                warn!("Summarization failed: {e}. Using fallback summary.");
                None
            }
        }
    }

    fn finish(
        &self,
        strategy: CompactionStrategy,
        original: &[Arc<Message>],
        messages: Vec<Arc<Message>>,
        tokens_before: usize,
        summary: Option<SummarySource>,
    ) -> Compacted {
        let report = CompactionReport {
            strategy,
            tokens_before,
            tokens_after: self.estimator.estimate_messages(&messages),
            messages_before: original.len(),
            messages_after: messages.len(),
            summary,
        };
        info!("{}", report.to_log_string());
        Compacted { messages, report }
    }
}

/// Run the ladder with the heuristic estimator.
pub async fn compact_messages(
    messages: &[Arc<Message>],
    context_window: i64,
    system_prompt: &str,
    config: &CompactionConfig,
    summarizer: Option<&dyn TextSummarizer>,
) -> Option<Compacted> {
    CompactionLadder::new(config.clone())
        .compact(messages, context_window, system_prompt, summarizer)
        .await
}

/// Rung 1: cut text in stale tool-result messages to
/// [`TOOL_OUTPUT_TRUNCATE_CHARS`] characters plus [`TRUNCATION_MARKER`].
pub fn truncate_stale_tool_output(
    messages: &[Arc<Message>],
    keep_recent: usize,
) -> Vec<Arc<Message>> {
    rewrite_stale(messages, keep_recent, |msg| {
        if msg.role != MessageRole::ToolResult {
            return None;
        }
        let mut changed = false;
        let content = msg
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } if exceeds_chars(text, TOOL_OUTPUT_TRUNCATE_CHARS) => {
                    changed = true;
                    ContentBlock::text(cut_tool_output(text))
                }
                ContentBlock::ToolResult { text }
                    if exceeds_chars(text, TOOL_OUTPUT_TRUNCATE_CHARS) =>
                {
                    changed = true;
                    ContentBlock::tool_result(cut_tool_output(text))
                }
                ContentBlock::Text { .. }
                | ContentBlock::ToolResult { .. }
                | ContentBlock::Thinking { .. }
                | ContentBlock::ToolCall { .. } => block.clone(),
            })
            .collect();
        changed.then(|| msg.with_content(content))
    })
}

/// Rung 2: remove every `thinking` block from stale assistant messages.
pub fn drop_stale_thinking(messages: &[Arc<Message>], keep_recent: usize) -> Vec<Arc<Message>> {
    rewrite_stale(messages, keep_recent, |msg| {
        if msg.role != MessageRole::Assistant || !msg.has_thinking() {
            return None;
        }
        let content = msg
            .content
            .iter()
            .filter(|b| !matches!(b, ContentBlock::Thinking { .. }))
            .cloned()
            .collect();
        Some(msg.with_content(content))
    })
}

/// Apply `rewrite` to messages before the recency window. `None` keeps the
/// original `Arc`.
fn rewrite_stale(
    messages: &[Arc<Message>],
    keep_recent: usize,
    mut rewrite: impl FnMut(&Message) -> Option<Message>,
) -> Vec<Arc<Message>> {
    let stale_end = messages.len().saturating_sub(keep_recent);
    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            if i < stale_end
                && let Some(rewritten) = rewrite(msg)
            {
                Arc::new(rewritten)
            } else {
                Arc::clone(msg)
            }
        })
        .collect()
}

fn exceeds_chars(text: &str, max: usize) -> bool {
    text.chars().nth(max).is_some()
}

fn cut_tool_output(text: &str) -> String {
    format!(
        "{}{TRUNCATION_MARKER}",
        truncate_chars(text, TOOL_OUTPUT_TRUNCATE_CHARS)
    )
}

fn synthetic_summary(first: &Message, text: String) -> Message {
    Message::assistant_text(text)
        .with_timestamp(now_millis())
        .with_provenance(first.provenance.clone().unwrap_or_else(Provenance::unknown))
        .with_usage(Usage::default())
}
