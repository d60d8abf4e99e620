//! Per-invocation settings shared by budgeting, compaction, and flushing.
//!
//! # Examples
//!
//! ```
//! use ctxwin::context::CompactionConfig;
//!
//! let config = CompactionConfig::new()
//!     .with_keep_recent(6)
//!     .with_history_threshold_fraction(0.75);
//! assert_eq!(config.history_threshold_tokens(100_000), 75_000);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default share of the window reserved for the model's reply.
pub const DEFAULT_OUTPUT_RESERVE_FRACTION: f64 = 0.15;

/// Default share of the window history may fill before compaction.
pub const DEFAULT_HISTORY_THRESHOLD_FRACTION: f64 = 0.80;

/// Default number of most recent messages no strategy may touch.
pub const DEFAULT_KEEP_RECENT_COUNT: usize = 10;

/// Settings for budget accounting and the compaction ladder.
///
/// Deserializes with every field optional, so a config file only needs the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Fraction of the window reserved for output, in (0, 1).
    pub output_reserve_fraction: f64,
    /// Fraction of the window history may occupy, in (0, 1).
    pub history_threshold_fraction: f64,
    /// Most recent messages preserved verbatim.
    pub keep_recent_count: usize,
    /// Give up on the summarizer after this many milliseconds. `None` waits
    /// for the capability's own timeout.
    pub summarizer_timeout_ms: Option<u64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            output_reserve_fraction: DEFAULT_OUTPUT_RESERVE_FRACTION,
            history_threshold_fraction: DEFAULT_HISTORY_THRESHOLD_FRACTION,
            keep_recent_count: DEFAULT_KEEP_RECENT_COUNT,
            summarizer_timeout_ms: None,
        }
    }
}

impl CompactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keep_recent(mut self, count: usize) -> Self {
        self.keep_recent_count = count;
        self
    }

    pub fn with_output_reserve_fraction(mut self, fraction: f64) -> Self {
        self.output_reserve_fraction = fraction;
        self
    }

    pub fn with_history_threshold_fraction(mut self, fraction: f64) -> Self {
        self.history_threshold_fraction = fraction;
        self
    }

    pub fn with_summarizer_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.summarizer_timeout_ms = Some(millis);
        self
    }

    /// Summarizer deadline, if any.
    pub fn summarizer_timeout(&self) -> Option<Duration> {
        self.summarizer_timeout_ms.map(Duration::from_millis)
    }

    /// Replace fractions outside the open interval (0, 1), or NaN, with
    /// their defaults.
    pub fn sanitized(mut self) -> Self {
        if !is_open_unit(self.output_reserve_fraction) {
            self.output_reserve_fraction = DEFAULT_OUTPUT_RESERVE_FRACTION;
        }
        if !is_open_unit(self.history_threshold_fraction) {
            self.history_threshold_fraction = DEFAULT_HISTORY_THRESHOLD_FRACTION;
        }
        self
    }

    /// `floor(window × output_reserve_fraction)`.
    pub fn output_reserve_tokens(&self, context_window: usize) -> usize {
        fraction_of(context_window, self.output_reserve_fraction)
    }

    /// `floor(window × history_threshold_fraction)`.
    pub fn history_threshold_tokens(&self, context_window: usize) -> usize {
        fraction_of(context_window, self.history_threshold_fraction)
    }

    /// Whether a history of `len` messages is too short to compact at all:
    /// the recency window plus the anchoring first message already cover it.
    pub fn is_within_recency_window(&self, len: usize) -> bool {
        len <= self.keep_recent_count.saturating_add(1)
    }
}

/// Clamp a signed window size from the host to a usable token count.
pub fn clamp_window(context_window: i64) -> usize {
    usize::try_from(context_window).unwrap_or(0)
}

fn fraction_of(tokens: usize, fraction: f64) -> usize {
    // Float-to-int casts saturate: NaN and negatives become 0.
    (tokens as f64 * fraction).floor() as usize
}

fn is_open_unit(f: f64) -> bool {
    f > 0.0 && f < 1.0
}
