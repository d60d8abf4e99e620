//! Token estimation for text and structured messages.
//!
//! The default estimator is a character-class heuristic: CJK characters cost
//! 1.5 tokens each, everything else 0.25 tokens, rounded up. It is cheap
//! enough to run on every turn and deliberately errs high for Chinese,
//! Japanese, and Korean text where byte- or char-ratio estimates undercount.
//!
//! A precise [`Tokenizer`] can be plugged into a [`TokenEstimator`]. When it
//! returns an error the heuristic answers instead; callers only ever see a
//! count, never a failure.

use crate::{ContentBlock, Message};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::trace;

/// Fixed per-message cost for role and formatting tokens.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Heuristic costs in quarter tokens: 1.5 per CJK char, 0.25 otherwise.
const CJK_QUARTER_TOKENS: usize = 6;
const OTHER_QUARTER_TOKENS: usize = 1;

/// A precise tokenizer that can replace the heuristic.
///
/// Implementations wrap a real BPE vocabulary or a provider's counting
/// endpoint. Neither an `Err` nor a panic is surfaced; the estimator falls
/// back to the heuristic for that call.
pub trait Tokenizer: Send + Sync {
    /// Count tokens in `text`.
    fn count(&self, text: &str) -> Result<usize, String>;
}

/// Whether `c` counts as CJK for estimation: Han ideographs (including
/// extension A/B and compatibility forms), CJK symbols and punctuation,
/// kana, Hangul syllables, and fullwidth forms.
pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3000..=0x303F     // CJK symbols and punctuation
            | 0x3040..=0x30FF   // hiragana, katakana
            | 0x3400..=0x4DBF   // extension A
            | 0x4E00..=0x9FFF   // unified ideographs
            | 0xAC00..=0xD7AF   // Hangul syllables
            | 0xF900..=0xFAFF   // compatibility ideographs
            | 0xFF00..=0xFFEF   // halfwidth and fullwidth forms
            | 0x20000..=0x2A6DF // extension B
    )
}

/// Estimate tokens in `text` with the CJK-aware heuristic.
///
/// Returns 0 for empty or whitespace-only input and at least 1 otherwise.
pub fn estimate_tokens(text: &str) -> usize {
    if text.trim().is_empty() {
        return 0;
    }
    let quarters: usize = text
        .chars()
        .map(|c| {
            if is_cjk(c) {
                CJK_QUARTER_TOKENS
            } else {
                OTHER_QUARTER_TOKENS
            }
        })
        .sum();
    quarters.div_ceil(4)
}

/// Estimate tokens for one message with the heuristic.
pub fn estimate_message_tokens(message: &Message) -> usize {
    message_tokens_with(message, estimate_tokens)
}

/// Estimate tokens for a list of messages with the heuristic. Empty lists
/// cost nothing.
pub fn estimate_messages_tokens(messages: &[Arc<Message>]) -> usize {
    messages.iter().map(|m| estimate_message_tokens(m)).sum()
}

fn message_tokens_with(message: &Message, count: impl Fn(&str) -> usize) -> usize {
    let content: usize = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text }
            | ContentBlock::Thinking { text }
            | ContentBlock::ToolResult { text } => count(text),
            ContentBlock::ToolCall { name, arguments } => {
                count(name) + count(&arguments.to_string())
            }
        })
        .sum();
    content + MESSAGE_OVERHEAD_TOKENS
}

/// Token counter with an optional precise tokenizer.
///
/// `TokenEstimator::default()` is the pure heuristic. Cloning is cheap; the
/// tokenizer is shared.
#[derive(Clone, Default)]
pub struct TokenEstimator {
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl TokenEstimator {
    /// Heuristic-only estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a precise tokenizer, falling back to the heuristic on error.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Whether a precise tokenizer is attached.
    pub fn is_precise(&self) -> bool {
        self.tokenizer.is_some()
    }

    /// Count tokens in `text`. Never fails.
    pub fn estimate(&self, text: &str) -> usize {
        if text.trim().is_empty() {
            return 0;
        }
        match &self.tokenizer {
            Some(tokenizer) => {
                match panic::catch_unwind(AssertUnwindSafe(|| tokenizer.count(text))) {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        trace!("Tokenizer failed ({e}); using heuristic estimate");
                        estimate_tokens(text)
                    }
                    Err(_) => {
                        trace!("Tokenizer panicked; using heuristic estimate");
                        estimate_tokens(text)
                    }
                }
            }
            None => estimate_tokens(text),
        }
    }

    /// Count tokens for one message, including [`MESSAGE_OVERHEAD_TOKENS`].
    pub fn estimate_message(&self, message: &Message) -> usize {
        message_tokens_with(message, |text| self.estimate(text))
    }

    /// Count tokens for a list of messages.
    pub fn estimate_messages(&self, messages: &[Arc<Message>]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

impl fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("precise", &self.is_precise())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn count(&self, text: &str) -> Result<usize, String> {
            Ok(text.split_whitespace().count())
        }
    }

    struct BrokenTokenizer;

    impl Tokenizer for BrokenTokenizer {
        fn count(&self, _text: &str) -> Result<usize, String> {
            Err("vocabulary not loaded".into())
        }
    }

    struct PanickingTokenizer;

    impl Tokenizer for PanickingTokenizer {
        fn count(&self, _text: &str) -> Result<usize, String> {
            panic!("merge table corrupted")
        }
    }

    #[test]
    fn empty_and_whitespace_cost_nothing() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   \n\t "), 0);
    }

    #[test]
    fn non_empty_costs_something() {
        assert!(estimate_tokens("a") > 0);
        assert!(estimate_tokens("你") > 0);
        assert!(estimate_tokens(" x ") > 0);
    }

    #[test]
    fn cjk_costs_more_than_latin() {
        assert!(estimate_tokens("你好世界") > estimate_tokens("abcd"));
        assert_eq!(estimate_tokens("你好世界"), 6);
        assert_eq!(estimate_tokens("abcd"), 1);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("你"), 2);
    }

    #[test]
    fn monotonic_in_length() {
        let mut prev = 0;
        for n in 1..64 {
            let cost = estimate_tokens(&"x".repeat(n));
            assert!(cost >= prev);
            prev = cost;
        }

        let mut prev = 0;
        for n in 1..64 {
            let cost = estimate_tokens(&"你".repeat(n));
            assert!(cost >= prev);
            prev = cost;
        }
    }

    #[test]
    fn fullwidth_and_cjk_punctuation_count_as_cjk() {
        assert!(is_cjk('，'));
        assert!(is_cjk('。'));
        assert!(is_cjk('Ａ'));
        assert!(!is_cjk(','));
    }

    #[test]
    fn message_tokens_include_overhead_and_tool_args() {
        let empty = Message::assistant_blocks(vec![]);
        assert_eq!(estimate_message_tokens(&empty), MESSAGE_OVERHEAD_TOKENS);

        let call = Message::assistant_blocks(vec![ContentBlock::tool_call(
            "memory_write",
            serde_json::json!({"path": "memory/PROFILE.md", "content": "likes tea"}),
        )]);
        assert!(estimate_message_tokens(&call) > MESSAGE_OVERHEAD_TOKENS + 5);
    }

    #[test]
    fn thinking_counts_toward_message() {
        let plain = Message::assistant_text("ok");
        let with_thinking = Message::assistant_blocks(vec![
            ContentBlock::thinking("x".repeat(400)),
            ContentBlock::text("ok"),
        ]);
        assert_eq!(
            estimate_message_tokens(&with_thinking),
            estimate_message_tokens(&plain) + 100
        );
    }

    #[test]
    fn empty_list_is_zero() {
        assert_eq!(estimate_messages_tokens(&[]), 0);
    }

    #[test]
    fn precise_tokenizer_is_used() {
        let est = TokenEstimator::new().with_tokenizer(Arc::new(WordTokenizer));
        assert!(est.is_precise());
        assert_eq!(est.estimate("one two three"), 3);
    }

    #[test]
    fn broken_tokenizer_falls_back_silently() {
        let est = TokenEstimator::new().with_tokenizer(Arc::new(BrokenTokenizer));
        assert_eq!(est.estimate("abcdefgh"), estimate_tokens("abcdefgh"));
        assert_eq!(est.estimate(""), 0);
    }

    #[test]
    fn panicking_tokenizer_falls_back_silently() {
        let est = TokenEstimator::new().with_tokenizer(Arc::new(PanickingTokenizer));
        assert_eq!(est.estimate("你好 world"), estimate_tokens("你好 world"));

        let message = Message::user("hello there");
        assert_eq!(est.estimate_message(&message), estimate_message_tokens(&message));
    }

    #[test]
    fn estimator_matches_free_functions_by_default() {
        let est = TokenEstimator::default();
        let messages: Vec<Arc<Message>> = vec![
            Message::user("hello there").into(),
            Message::assistant_text("你好").into(),
        ];
        assert_eq!(
            est.estimate_messages(&messages),
            estimate_messages_tokens(&messages)
        );
    }
}
