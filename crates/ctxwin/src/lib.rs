//! Context window management for LLM chat clients.
//!
//! `ctxwin` keeps a growing conversation inside a fixed token budget without
//! breaking its coherence. It estimates how many tokens a history occupies,
//! accounts for that usage against a context window, and rewrites the history
//! through a lossless-to-lossy compaction ladder when the window would
//! overflow.
//!
//! The crate performs no I/O of its own. Message lists are in-memory values
//! owned by the host; the only outside call is an optional, injected
//! [`TextSummarizer`](context::summarizer::TextSummarizer) used as the last
//! rung of the ladder.
//!
//! # Getting started
//!
//! ```ignore
//! use ctxwin::prelude::*;
//!
//! let mut session = ContextSession::new(128_000);
//!
//! // Before each model call:
//! let plan = session
//!     .prepare_turn(&history, system_prompt, lorebook, Some(&summarizer), now_ms)
//!     .await;
//! if let Some(instruction) = plan.flush_instruction {
//!     // inject `instruction` as a system note for this turn
//! }
//! history = plan.messages;
//!
//! // While the turn runs:
//! session.record_tool_output(&tool_result_text);
//!
//! // Before showing the final reply:
//! let reply = session.finish_reply(&assistant_text);
//! ```
//!
//! # Where to find things
//!
//! - **Count tokens:** [`context::tokens`]: CJK-aware heuristic plus a
//!   pluggable [`Tokenizer`](context::tokens::Tokenizer).
//! - **Account for a budget:** [`context::budget`]: [`TokenBudget`](context::budget::TokenBudget)
//!   breakdowns and display helpers.
//! - **Shrink history:** [`context::compaction`]: the three-rung
//!   [`CompactionLadder`](context::compaction::CompactionLadder).
//! - **Save facts before they are compacted:** [`context::flush`].
//! - **Keep replies from echoing tool output:** [`context::dedup`].
//! - **All of the above per turn:** [`context::session::ContextSession`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Token estimation, budgets, compaction, flush scheduling, reply deduplication |
//! | [`prelude`] | Glob-importable re-exports |

pub mod context;
pub mod prelude;

use serde::{Deserialize, Serialize};

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    ToolResult,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::ToolResult => write!(f, "tool"),
        }
    }
}

/// One unit of structured message content.
///
/// Closed set: every consumer matches all four kinds explicitly, so adding a
/// kind is a compile error everywhere content is inspected.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Visible text.
    Text { text: String },
    /// Model reasoning. Never shown to the user; first to go under pressure.
    Thinking { text: String },
    /// A tool invocation requested by the model.
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// Output returned by a tool.
    ToolResult { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        ContentBlock::Thinking { text: text.into() }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        ContentBlock::ToolCall {
            name: name.into(),
            arguments,
        }
    }

    pub fn tool_result(text: impl Into<String>) -> Self {
        ContentBlock::ToolResult { text: text.into() }
    }
}

/// API / provider / model identifiers of the call that produced a message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Provenance {
    pub api: String,
    pub provider: String,
    pub model: String,
}

impl Provenance {
    pub fn new(
        api: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api: api.into(),
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Placeholder used when the source message carries no provenance.
    pub fn unknown() -> Self {
        Self::new("unknown", "unknown", "unknown")
    }
}

/// Token usage and cost attributed to a message.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

/// A message in the conversation.
///
/// Treated as an immutable value: transformations build new messages and
/// share unchanged ones through `Arc<Message>`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Creation time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    /// Build a message from a role and content blocks.
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            timestamp: None,
            provenance: None,
            usage: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ContentBlock::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(MessageRole::Assistant, blocks)
    }

    pub fn tool_result(text: impl Into<String>) -> Self {
        Self::new(MessageRole::ToolResult, vec![ContentBlock::text(text)])
    }

    pub fn with_timestamp(mut self, epoch_ms: i64) -> Self {
        self.timestamp = Some(epoch_ms);
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Copy of this message with different content; metadata is kept.
    pub fn with_content(&self, content: Vec<ContentBlock>) -> Self {
        Self {
            role: self.role,
            content,
            timestamp: self.timestamp,
            provenance: self.provenance.clone(),
            usage: self.usage.clone(),
        }
    }

    /// Visible text of the message: `text` and `tool_result` blocks joined
    /// by newlines. Reasoning and tool calls are skipped.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } | ContentBlock::ToolResult { text } => {
                    Some(text.as_str())
                }
                ContentBlock::Thinking { .. } | ContentBlock::ToolCall { .. } => None,
            })
            .collect();
        parts.join("\n")
    }

    /// Whether any block is model reasoning.
    pub fn has_thinking(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::Thinking { .. }))
    }
}

// ── Text helpers ───────────────────────────────────────────────────

/// Return at most the first `max_chars` characters of `s`.
///
/// Cuts on a char boundary; never splits a multi-byte character.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s.get(..idx).unwrap_or(s),
        None => s,
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
