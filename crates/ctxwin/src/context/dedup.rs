//! Keeps the assistant's final reply from repeating tool output verbatim.
//!
//! During a turn every tool result is recorded with
//! [`ReplyDeduplicator::record_tool_output`]. Before the reply is shown,
//! [`ReplyDeduplicator::filter_reply`] drops paragraphs that merely echo one
//! of those outputs. Comparison happens on a normalized form (lowercased,
//! whitespace and punctuation removed) so that "已写入记忆文件：memory/PROFILE.md"
//! and "已写入记忆文件: memory/profile.md" count as the same text.
//!
//! State is per turn: the host calls [`reset()`](ReplyDeduplicator::reset)
//! at each turn boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Trigram Jaccard similarity above which two texts are duplicates.
/// Empirically tuned.
pub const SIMILARITY_THRESHOLD: f64 = 0.85;

/// Substring containment only counts when the shorter normalized text is
/// longer than this many characters.
pub const MIN_SUBSTRING_CHARS: usize = 8;

/// Tunables for duplicate detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicatorConfig {
    pub similarity_threshold: f64,
    pub min_substring_chars: usize,
}

impl Default for DeduplicatorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: SIMILARITY_THRESHOLD,
            min_substring_chars: MIN_SUBSTRING_CHARS,
        }
    }
}

impl DeduplicatorConfig {
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_min_substring_chars(mut self, chars: usize) -> Self {
        self.min_substring_chars = chars;
        self
    }
}

type Trigram = [char; 3];

/// One recorded tool output.
#[derive(Debug, Clone)]
struct DedupRecord {
    raw: String,
    normalized: String,
    normalized_len: usize,
    trigrams: HashSet<Trigram>,
}

impl DedupRecord {
    fn new(raw: &str, normalized: String) -> Self {
        let normalized_len = normalized.chars().count();
        Self {
            raw: raw.to_string(),
            trigrams: trigrams(&normalized),
            normalized,
            normalized_len,
        }
    }
}

/// Per-turn record of tool outputs and the reply filter built on it.
#[derive(Debug, Clone, Default)]
pub struct ReplyDeduplicator {
    config: DeduplicatorConfig,
    records: Vec<DedupRecord>,
}

impl ReplyDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DeduplicatorConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
        }
    }

    /// Remember a tool output for this turn.
    ///
    /// Text that normalizes to nothing (blank or punctuation only) is ignored
    /// and does not count towards [`recorded_count()`](Self::recorded_count).
    pub fn record_tool_output(&mut self, text: &str) {
        let normalized = normalize(text);
        if normalized.is_empty() {
            trace!("Ignoring empty tool output");
            return;
        }
        self.records.push(DedupRecord::new(text, normalized));
    }

    /// Whether `text` repeats any recorded tool output.
    pub fn is_duplicate(&self, text: &str) -> bool {
        let candidate = normalize(text);
        if candidate.is_empty() {
            return false;
        }
        let candidate_len = candidate.chars().count();
        let candidate_trigrams = trigrams(&candidate);

        self.records.iter().any(|record| {
            if record.normalized == candidate {
                return true;
            }
            let shorter = candidate_len.min(record.normalized_len);
            if shorter > self.config.min_substring_chars
                && (record.normalized.contains(&candidate)
                    || candidate.contains(&record.normalized))
            {
                return true;
            }
            jaccard(&candidate_trigrams, &record.trigrams) > self.config.similarity_threshold
        })
    }

    /// Drop reply paragraphs that duplicate recorded tool output.
    ///
    /// Paragraphs are separated by blank lines and rejoined with one blank
    /// line. If every paragraph would be dropped, or none is, `text` is
    /// returned unchanged.
    pub fn filter_reply(&self, text: &str) -> String {
        if self.records.is_empty() {
            return text.to_string();
        }

        let paragraphs = split_paragraphs(text);
        let kept: Vec<&str> = paragraphs
            .iter()
            .copied()
            .filter(|p| !self.is_duplicate(p.trim()))
            .collect();

        if kept.len() == paragraphs.len() {
            return text.to_string();
        }
        if kept.is_empty() {
            debug!("Reply consists only of tool output; keeping it unfiltered");
            return text.to_string();
        }
        debug!(
            "Dropped {} duplicate paragraph(s) from reply",
            paragraphs.len() - kept.len()
        );
        kept.join("\n\n")
    }

    /// Forget everything recorded this turn.
    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn recorded_count(&self) -> usize {
        self.records.len()
    }

    /// Tool outputs recorded this turn, as given.
    pub fn recorded(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.raw.as_str())
    }
}

// ── Normalization ──────────────────────────────────────────────────

/// Lowercase and strip whitespace plus Latin and CJK punctuation.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && !is_punctuation(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(c,
            '\u{2010}'..='\u{2027}'   // dashes, quotes, bullets, ellipsis
            | '\u{2030}'..='\u{205E}' // per mille, primes, misc
            | '\u{3000}'..='\u{303F}' // CJK symbols and punctuation
            | '\u{FF01}'..='\u{FF0F}' // fullwidth ！＂＃ ... ／
            | '\u{FF1A}'..='\u{FF20}' // fullwidth ：；＜ ... ＠
            | '\u{FF3B}'..='\u{FF40}'
            | '\u{FF5B}'..='\u{FF65}'
        )
}

fn trigrams(normalized: &str) -> HashSet<Trigram> {
    let chars: Vec<char> = normalized.chars().collect();
    chars.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// `|a ∩ b| / |a ∪ b|`; 0 when either side has no trigrams.
fn jaccard(a: &HashSet<Trigram>, b: &HashSet<Trigram>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Split on runs of blank lines. Returned paragraphs are non-blank.
fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        if line.trim().is_empty() {
            if let Some(s) = start.take()
                && let Some(p) = text.get(s..end)
            {
                paragraphs.push(p);
            }
        } else {
            start.get_or_insert(line_start);
            end = line_start + line.trim_end_matches(['\r', '\n']).len();
        }
    }
    if let Some(s) = start
        && let Some(p) = text.get(s..end)
    {
        paragraphs.push(p);
    }
    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAVED: &str = "已写入记忆文件：memory/PROFILE.md";
    const LONG: &str = "The storm knocked out the harbor lights and the ferry stayed docked until morning, so the keeper lit the old lamp by hand";
    const VARIANT: &str = "The storm knocked out the harbour lights and the ferry stayed docked until morning, so the keeper lit the old lamp by hand";

    #[test]
    fn normalize_strips_case_space_and_punctuation() {
        assert_eq!(normalize(SAVED), "已写入记忆文件memoryprofilemd");
        assert_eq!(normalize("  Hello, World!  "), "helloworld");
        assert_eq!(normalize("「你好」，世界。"), "你好世界");
        assert_eq!(normalize("...！？"), "");
    }

    #[test]
    fn empty_output_is_not_recorded() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output("");
        dedup.record_tool_output("   \n");
        dedup.record_tool_output("。。。");
        assert_eq!(dedup.recorded_count(), 0);

        dedup.record_tool_output(SAVED);
        assert_eq!(dedup.recorded_count(), 1);
        assert_eq!(dedup.recorded().collect::<Vec<_>>(), vec![SAVED]);
    }

    #[test]
    fn recorded_cjk_output_is_duplicate() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output(SAVED);
        assert!(dedup.is_duplicate(SAVED));
        assert!(dedup.is_duplicate("已写入记忆文件: memory/profile.md"));
        assert!(!dedup.is_duplicate("今天天气很好，我们去公园散步吧。"));
    }

    #[test]
    fn substring_either_direction() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output(SAVED);
        // Reply wraps the tool output.
        assert!(dedup.is_duplicate("好的，已写入记忆文件：memory/PROFILE.md。"));
        // Reply quotes part of the tool output.
        assert!(dedup.is_duplicate("memory/PROFILE.md"));
    }

    #[test]
    fn short_substrings_do_not_match() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output("The lighthouse keeper writes every night");
        // "keeper" normalizes to 6 chars: too short to count as containment.
        assert!(!dedup.is_duplicate("keeper"));
    }

    #[test]
    fn near_duplicate_by_trigram_similarity() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output(LONG);
        assert!(jaccard(&trigrams(&normalize(LONG)), &trigrams(&normalize(VARIANT))) > 0.85);
        assert!(dedup.is_duplicate(VARIANT));
    }

    #[test]
    fn reset_clears_records() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output(SAVED);
        dedup.reset();
        assert_eq!(dedup.recorded_count(), 0);
        assert!(!dedup.is_duplicate(SAVED));
    }

    #[test]
    fn filter_drops_duplicate_paragraph_and_keeps_rest() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output(SAVED);
        let reply = format!("我记住了你的名字。\n\n{SAVED}\n\n下次见！");
        assert_eq!(dedup.filter_reply(&reply), "我记住了你的名字。\n\n下次见！");
    }

    #[test]
    fn filter_never_empties_reply() {
        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output(SAVED);
        assert_eq!(dedup.filter_reply(SAVED), SAVED);

        let all_dupes = format!("{SAVED}\n\n  {SAVED}  ");
        assert_eq!(dedup.filter_reply(&all_dupes), all_dupes);
    }

    #[test]
    fn filter_without_records_or_matches_is_identity() {
        let reply = "line one\nline two\n\n\n  third paragraph  \n";
        assert_eq!(ReplyDeduplicator::new().filter_reply(reply), reply);

        let mut dedup = ReplyDeduplicator::new();
        dedup.record_tool_output("completely unrelated tool output text");
        assert_eq!(dedup.filter_reply(reply), reply);
    }

    #[test]
    fn split_paragraphs_on_blank_lines() {
        let text = "a\nb\n\n  \nc\r\n\r\nd";
        assert_eq!(split_paragraphs(text), vec!["a\nb", "c", "d"]);
        assert!(split_paragraphs("\n\n").is_empty());
    }

    #[test]
    fn custom_threshold_is_honoured() {
        let mut strict = ReplyDeduplicator::with_config(
            DeduplicatorConfig::default()
                .with_similarity_threshold(0.99)
                .with_min_substring_chars(1_000),
        );
        strict.record_tool_output(LONG);
        assert!(!strict.is_duplicate(VARIANT));
    }
}
