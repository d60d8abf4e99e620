//! Inspect and compact chat transcripts from the command line.
//!
//! A transcript is a JSON array of messages as serialized by
//! [`ctxwin::Message`].
//!
//! # Examples
//!
//! ```sh
//! # How much of a 32K window does this conversation use?
//! ctxwin budget chat.json --window 32000 --system persona.txt --lorebook lore.txt
//!
//! # Shrink it to fit, keeping the last 6 messages verbatim
//! ctxwin compact chat.json --window 8000 --keep-recent 6 --output compacted.json
//!
//! # Strip paragraphs that echo tool output from a reply
//! ctxwin dedup --tool-output write_result.txt reply.txt
//!
//! # Override defaults from a config file, with debug logs on stderr
//! ctxwin -vv --config ctxwin.json compact chat.json --window 8000
//! ```

use clap::{Parser, Subcommand};
use ctxwin::context::{
    CompactionConfig, CompactionLadder, DeduplicatorConfig, ReplyDeduplicator, calculate_budget,
    format_budget,
};
use ctxwin::Message;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Context window budgeting and compaction for chat transcripts.
#[derive(Parser)]
#[command(name = "ctxwin", version)]
struct Cli {
    /// JSON file overriding compaction and dedup settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the token budget of a transcript
    Budget {
        /// Transcript JSON file
        transcript: PathBuf,

        /// Model context window in tokens
        #[arg(long)]
        window: i64,

        /// File holding the system prompt
        #[arg(long)]
        system: Option<PathBuf>,

        /// File holding injected lorebook text
        #[arg(long)]
        lorebook: Option<PathBuf>,
    },

    /// Compact a transcript with the deterministic fallback summary
    Compact {
        /// Transcript JSON file
        transcript: PathBuf,

        /// Model context window in tokens
        #[arg(long)]
        window: i64,

        /// Most recent messages to keep verbatim
        #[arg(long)]
        keep_recent: Option<usize>,

        /// File holding the system prompt
        #[arg(long)]
        system: Option<PathBuf>,

        /// Write the compacted transcript here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Drop reply paragraphs that repeat tool output
    Dedup {
        /// File holding one tool output; repeat for several
        #[arg(long = "tool-output", required = true)]
        tool_outputs: Vec<PathBuf>,

        /// File holding the assistant reply
        reply: PathBuf,
    },
}

// ── Config file ────────────────────────────────────────────────────

/// Settings file accepted by `--config`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    compaction: CompactionConfig,
    dedup: DeduplicatorConfig,
}

fn load_config(path: Option<&Path>) -> Result<CliConfig, String> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let raw = read_text(path)?;
    let mut config: CliConfig = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid config '{}': {e}", path.display()))?;
    config.compaction = config.compaction.sanitized();
    Ok(config)
}

// ── Input helpers ──────────────────────────────────────────────────

fn read_text(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("failed to read '{}': {e}", path.display()))
}

fn read_optional(path: Option<&Path>) -> Result<String, String> {
    path.map(read_text).transpose().map(Option::unwrap_or_default)
}

fn load_transcript(path: &Path) -> Result<Vec<Arc<Message>>, String> {
    let raw = read_text(path)?;
    let messages: Vec<Message> = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid transcript '{}': {e}", path.display()))?;
    debug!("Loaded {} message(s) from {}", messages.len(), path.display());
    Ok(messages.into_iter().map(Arc::new).collect())
}

fn render_transcript(messages: &[Arc<Message>]) -> Result<String, String> {
    let plain: Vec<&Message> = messages.iter().map(Arc::as_ref).collect();
    serde_json::to_string_pretty(&plain).map_err(|e| format!("failed to serialize transcript: {e}"))
}

// ── Subcommands ────────────────────────────────────────────────────

fn run_budget(
    config: &CliConfig,
    transcript: &Path,
    window: i64,
    system: Option<&Path>,
    lorebook: Option<&Path>,
) -> Result<String, String> {
    let messages = load_transcript(transcript)?;
    let system_prompt = read_optional(system)?;
    let lorebook = read_optional(lorebook)?;

    let budget = calculate_budget(
        window,
        &system_prompt,
        &lorebook,
        &messages,
        &config.compaction,
    );
    Ok(format!(
        "{}\n{}% of {} tokens used\n",
        format_budget(&budget),
        budget.usage_percent(),
        budget.context_window,
    ))
}

async fn run_compact(
    config: &CliConfig,
    transcript: &Path,
    window: i64,
    keep_recent: Option<usize>,
    system: Option<&Path>,
    output: Option<&Path>,
) -> Result<String, String> {
    let messages = load_transcript(transcript)?;
    let system_prompt = read_optional(system)?;

    let mut compaction = config.compaction.clone();
    if let Some(keep) = keep_recent {
        compaction = compaction.with_keep_recent(keep);
    }
    let ladder = CompactionLadder::new(compaction);

    let result = ladder.compact(&messages, window, &system_prompt, None).await;
    let (compacted, summary_line) = match result {
        Some(result) => (result.messages, result.report.to_log_string()),
        None => (messages, "compaction: not needed".to_string()),
    };
    let rendered = render_transcript(&compacted)?;

    match output {
        Some(path) => {
            fs::write(path, format!("{rendered}\n"))
                .map_err(|e| format!("failed to write '{}': {e}", path.display()))?;
            Ok(format!("{summary_line}\nwrote {}\n", path.display()))
        }
        None => {
            eprintln!("{summary_line}");
            Ok(format!("{rendered}\n"))
        }
    }
}

fn run_dedup(config: &CliConfig, tool_outputs: &[PathBuf], reply: &Path) -> Result<String, String> {
    let mut dedup = ReplyDeduplicator::with_config(config.dedup.clone());
    for path in tool_outputs {
        dedup.record_tool_output(&read_text(path)?);
    }
    let reply = read_text(reply)?;
    Ok(dedup.filter_reply(&reply))
}

async fn run(cli: &Cli) -> Result<String, String> {
    let config = load_config(cli.config.as_deref())?;
    match &cli.command {
        Command::Budget {
            transcript,
            window,
            system,
            lorebook,
        } => run_budget(
            &config,
            transcript,
            *window,
            system.as_deref(),
            lorebook.as_deref(),
        ),
        Command::Compact {
            transcript,
            window,
            keep_recent,
            system,
            output,
        } => {
            run_compact(
                &config,
                transcript,
                *window,
                *keep_recent,
                system.as_deref(),
                output.as_deref(),
            )
            .await
        }
        Command::Dedup {
            tool_outputs,
            reply,
        } => run_dedup(&config, tool_outputs, reply),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(level)
        .with(stderr_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli).await {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxwin::context::summarizer::COMPACTION_MARKER;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn long_transcript(count: usize) -> NamedTempFile {
        let messages: Vec<Message> = (0..count)
            .map(|i| {
                let text = format!("turn {i} {}", "q".repeat(190));
                if i % 2 == 0 {
                    Message::user(text)
                } else {
                    Message::assistant_text(text)
                }
            })
            .collect();
        write_temp(&serde_json::to_string(&messages).unwrap())
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "ctxwin", "-vv", "compact", "chat.json", "--window", "8000", "--keep-recent", "4",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Compact {
                window,
                keep_recent,
                ..
            } => {
                assert_eq!(window, 8_000);
                assert_eq!(keep_recent, Some(4));
            }
            _ => panic!("expected compact"),
        }

        assert!(Cli::try_parse_from(["ctxwin", "dedup", "reply.txt"]).is_err());
    }

    #[test]
    fn load_transcript_reports_bad_json() {
        let file = write_temp("{not json");
        let err = load_transcript(file.path()).unwrap_err();
        assert!(err.contains("invalid transcript"));

        let missing = load_transcript(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(missing.contains("failed to read"));
    }

    #[test]
    fn config_file_overrides_and_sanitizes() {
        let file = write_temp(
            r#"{"compaction": {"keep_recent_count": 3, "history_threshold_fraction": 7.0},
                "dedup": {"similarity_threshold": 0.9}}"#,
        );
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.compaction.keep_recent_count, 3);
        assert!((config.compaction.history_threshold_fraction - 0.80).abs() < f64::EPSILON);
        assert!((config.dedup.similarity_threshold - 0.9).abs() < f64::EPSILON);

        let defaults = load_config(None).unwrap();
        assert_eq!(defaults.compaction, CompactionConfig::default());
    }

    #[test]
    fn budget_prints_breakdown() {
        let transcript = long_transcript(4);
        let system = write_temp("You are Mira, the lighthouse keeper.");
        let out = run_budget(
            &CliConfig::default(),
            transcript.path(),
            128_000,
            Some(system.path()),
            None,
        )
        .unwrap();
        assert!(out.contains("system "));
        assert!(out.contains("reserve 19.2K"));
        assert!(!out.contains("lorebook"));
        assert!(out.contains("% of 128000 tokens used"));
    }

    #[tokio::test]
    async fn compact_writes_output_file() {
        let transcript = long_transcript(20);
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("compacted.json");

        let out = run_compact(
            &CliConfig::default(),
            transcript.path(),
            200,
            None,
            None,
            Some(&output),
        )
        .await
        .unwrap();
        assert!(out.contains("summarize (fallback summary)"));

        let compacted = load_transcript(&output).unwrap();
        assert_eq!(compacted.len(), 12);
        assert!(compacted[1].text().starts_with(COMPACTION_MARKER));
    }

    #[tokio::test]
    async fn compact_passes_through_when_not_needed() {
        let transcript = long_transcript(5);
        let out = run_compact(
            &CliConfig::default(),
            transcript.path(),
            128_000,
            Some(2),
            None,
            None,
        )
        .await
        .unwrap();
        let messages: Vec<Message> = serde_json::from_str(&out).unwrap();
        assert_eq!(messages.len(), 5);
    }

    #[test]
    fn dedup_filters_reply() {
        let tool = write_temp("已写入记忆文件：memory/PROFILE.md");
        let reply = write_temp("记住了。\n\n已写入记忆文件：memory/PROFILE.md\n");
        let out = run_dedup(
            &CliConfig::default(),
            &[tool.path().to_path_buf()],
            reply.path(),
        )
        .unwrap();
        assert_eq!(out, "记住了。");
    }
}
