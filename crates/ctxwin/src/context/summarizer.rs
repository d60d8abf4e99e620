//! Summarization capability and the text fed to it.
//!
//! The last rung of the compaction ladder collapses the middle of a
//! conversation into one message. When a [`TextSummarizer`] is available the
//! middle is rendered as a role-labelled transcript and handed to it; when
//! none is supplied, or the call fails, [`fallback_summary`] builds a
//! deterministic digest locally.

use crate::{Message, MessageRole, truncate_chars};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Per-message character cap in the transcript sent to a summarizer.
pub const TRANSCRIPT_MESSAGE_CHARS: usize = 500;

/// Per-line character cap in the deterministic fallback.
pub const FALLBACK_LINE_CHARS: usize = 100;

/// Maximum lines in the deterministic fallback.
pub const FALLBACK_MAX_LINES: usize = 20;

/// Leading text of every synthetic summary message.
pub const COMPACTION_MARKER: &str = "[Context compacted";

/// Boxed future returned by [`TextSummarizer::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// An external capability that condenses a conversation transcript.
///
/// Called at most once per compaction. Errors and timeouts are absorbed by
/// the ladder, which switches to [`fallback_summary`].
///
/// # Example
///
/// ```ignore
/// struct Canned;
///
/// impl TextSummarizer for Canned {
///     fn summarize(&self, conversation: &str) -> SummaryFuture<'_> {
///         let lines = conversation.lines().count();
///         Box::pin(async move { Ok(format!("{lines} lines of small talk.")) })
///     }
/// }
/// ```
pub trait TextSummarizer: Send + Sync {
    /// Summarize `conversation`, a newline-separated `[role]: text` transcript.
    ///
    /// Uses a boxed future so the trait stays dyn-compatible.
    fn summarize(&self, conversation: &str) -> SummaryFuture<'_>;
}

type ErasedSummaryHandler =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// Closure-backed [`TextSummarizer`].
///
/// ```ignore
/// let summarizer = FnSummarizer::new(|transcript: String| async move {
///     client.complete(SUMMARY_PROMPT, &transcript).await
/// });
/// ```
pub struct FnSummarizer {
    handler: ErasedSummaryHandler,
}

impl FnSummarizer {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let erased = move |conversation: String| -> Pin<
            Box<dyn Future<Output = Result<String, String>> + Send>,
        > { handler(conversation).boxed() };
        Self {
            handler: Box::new(erased),
        }
    }
}

impl TextSummarizer for FnSummarizer {
    fn summarize(&self, conversation: &str) -> SummaryFuture<'_> {
        (self.handler)(conversation.to_string())
    }
}

impl fmt::Debug for FnSummarizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSummarizer").finish_non_exhaustive()
    }
}

/// Header prepended to every summary, stating how much was folded away.
pub fn summary_header(compacted: usize) -> String {
    let noun = if compacted == 1 { "message" } else { "messages" };
    format!("{COMPACTION_MARKER}: {compacted} earlier {noun} summarized]")
}

/// Render `span` as `[role]: text` lines for a summarizer, capping each
/// message at [`TRANSCRIPT_MESSAGE_CHARS`] characters. Messages without
/// visible text are skipped.
pub fn build_transcript(span: &[Arc<Message>]) -> String {
    let mut transcript = String::new();
    for msg in span {
        let text = single_line(&msg.text());
        if text.is_empty() {
            continue;
        }
        let capped = truncate_chars(&text, TRANSCRIPT_MESSAGE_CHARS);
        transcript.push_str(&format!("[{}]: {capped}\n", msg.role));
    }
    transcript
}

/// Deterministic local summary of `span`.
///
/// Lists up to [`FALLBACK_MAX_LINES`] user and assistant lines, each capped
/// at [`FALLBACK_LINE_CHARS`] characters, then a count of lines left out.
pub fn fallback_summary(span: &[Arc<Message>]) -> String {
    let lines: Vec<String> = span
        .iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
        .filter_map(|m| {
            let text = single_line(&m.text());
            if text.is_empty() {
                None
            } else {
                Some(format!(
                    "{}: {}",
                    m.role,
                    truncate_chars(&text, FALLBACK_LINE_CHARS)
                ))
            }
        })
        .collect();

    let mut summary = lines
        .iter()
        .take(FALLBACK_MAX_LINES)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");

    let omitted = lines.len().saturating_sub(FALLBACK_MAX_LINES);
    if omitted > 0 {
        summary.push_str(&format!("\n... ({omitted} more lines omitted)"));
    }
    summary
}

/// Collapse runs of whitespace, including newlines, into single spaces.
fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentBlock;

    fn span(messages: Vec<Message>) -> Vec<Arc<Message>> {
        messages.into_iter().map(Arc::new).collect()
    }

    #[test]
    fn header_states_count() {
        assert_eq!(
            summary_header(18),
            "[Context compacted: 18 earlier messages summarized]"
        );
        assert!(summary_header(1).contains("1 earlier message summarized"));
        assert!(summary_header(3).starts_with(COMPACTION_MARKER));
    }

    #[test]
    fn transcript_labels_roles_and_caps_length() {
        let messages = span(vec![
            Message::user("Read the letter aloud"),
            Message::tool_result("x".repeat(800)),
            Message::assistant_blocks(vec![ContentBlock::thinking("hidden")]),
        ]);
        let transcript = build_transcript(&messages);
        assert!(transcript.contains("[user]: Read the letter aloud"));
        let tool_line = transcript.lines().nth(1).unwrap();
        assert_eq!(tool_line, format!("[tool]: {}", "x".repeat(500)));
        assert_eq!(transcript.lines().count(), 2, "thinking-only message skipped");
    }

    #[test]
    fn fallback_only_user_and_assistant() {
        let messages = span(vec![
            Message::user("hi"),
            Message::tool_result("tool noise"),
            Message::system("system noise"),
            Message::assistant_text("hello"),
        ]);
        let summary = fallback_summary(&messages);
        assert_eq!(summary, "user: hi\nassistant: hello");
    }

    #[test]
    fn fallback_caps_lines_and_counts_omitted() {
        let messages = span(
            (0..25)
                .map(|i| Message::user(format!("line {i} {}", "y".repeat(200))))
                .collect(),
        );
        let summary = fallback_summary(&messages);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 21);
        assert!(lines[0].chars().count() <= "user: ".len() + FALLBACK_LINE_CHARS);
        assert_eq!(lines[20], "... (5 more lines omitted)");
    }

    #[test]
    fn fallback_flattens_newlines() {
        let messages = span(vec![Message::assistant_text("first\n\nsecond")]);
        assert_eq!(fallback_summary(&messages), "assistant: first second");
    }

    #[tokio::test]
    async fn fn_summarizer_runs_closure() {
        let summarizer = FnSummarizer::new(|transcript: String| async move {
            Ok::<_, String>(format!("{} lines", transcript.lines().count()))
        });
        let result = summarizer.summarize("[user]: a\n[assistant]: b\n").await;
        assert_eq!(result, Ok("2 lines".to_string()));
    }

    #[tokio::test]
    async fn fn_summarizer_propagates_error_to_caller() {
        let summarizer =
            FnSummarizer::new(|_: String| futures::future::ready(Err("rate limited".to_string())));
        assert!(summarizer.summarize("x").await.is_err());
    }
}
