//! Operator CLI for inspecting context handling.
//!
//! # Examples
//!
//! ```sh
//! # Token estimate for a file or stdin
//! ctxkeep estimate src/lib.rs
//! cargo test 2>&1 | ctxkeep estimate
//!
//! # Truncate a build log the way tool output is truncated
//! ctxkeep truncate build.log --limit 4096
//!
//! # Show the merged instructions for a working directory
//! ctxkeep instructions --workdir ~/src/project
//!
//! # Replay a JSONL transcript through a session, compacting as needed
//! ctxkeep replay transcript.jsonl --window 32000
//! ```

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use ctxkeep::api::OpenRouterSummarizer;
use ctxkeep::config::ContextConfig;
use ctxkeep::context::{
    ConversationItem, ExtractiveSummarizer, LoggingHandler, OutputTruncator, SummaryBackend,
    estimate_tokens,
};
use ctxkeep::instructions::{InstructionLoader, InstructionPaths, Layer};
use ctxkeep::session::Session;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "ctxkeep", version, about = "Inspect agent context handling")]
struct Cli {
    /// TOML config file (defaults apply to missing fields)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the token estimate for a file, or stdin when omitted
    Estimate { file: Option<PathBuf> },

    /// Truncate a file (or stdin) and print the result; the record goes to stderr as JSON
    Truncate {
        file: Option<PathBuf>,
        /// Byte limit (defaults to the configured output limit)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Load, merge, and print the instruction layers for a directory
    Instructions {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },

    /// Replay a JSONL transcript of conversation items through a session
    Replay {
        transcript: PathBuf,
        /// Model context window in tokens
        #[arg(long)]
        window: Option<usize>,
        #[arg(long, value_enum, default_value_t = Backend::Extractive)]
        backend: Backend,
        /// Model for the openrouter backend
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Extractive,
    Openrouter,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ctxkeep=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = match cli.config {
        Some(ref path) => ContextConfig::load(path).map_err(|e| e.to_string())?,
        None => ContextConfig::default(),
    };

    match cli.command {
        Command::Estimate { file } => {
            let text = read_input(file.as_deref())?;
            println!("{}", estimate_tokens(&text));
        }
        Command::Truncate { file, limit } => {
            let text = read_input(file.as_deref())?;
            let truncator = OutputTruncator::new(limit.unwrap_or(config.output_limit_bytes))
                .with_head_fraction(config.truncation_head_fraction);
            let (out, record) = truncator.truncate(&text);
            print!("{out}");
            if let Some(record) = record {
                let json = serde_json::to_string(&record).map_err(|e| e.to_string())?;
                eprintln!("{json}");
            }
        }
        Command::Instructions { workdir } => {
            let paths = InstructionPaths::discover(&workdir);
            let set = InstructionLoader::new()
                .with_ceiling_bytes(config.instruction_ceiling_bytes)
                .load(&paths)
                .map_err(|e| e.to_string())?;
            for layer in [Layer::Global, Layer::Project, Layer::Local] {
                let bytes = set.layer(layer).map_or(0, str::len);
                eprintln!("{layer}: {bytes} bytes");
            }
            for trim in &set.trims {
                warn!(
                    layer = %trim.layer,
                    dropped = trim.dropped,
                    "trimmed {} -> {} bytes",
                    trim.original_bytes,
                    trim.retained_bytes
                );
            }
            eprintln!(
                "merged: {} bytes, ~{} tokens (ceiling {})",
                set.merged.len(),
                set.estimated_tokens(),
                set.ceiling_bytes
            );
            print!("{}", set.merged);
        }
        Command::Replay {
            transcript,
            window,
            backend,
            model,
        } => {
            let config = match window {
                Some(w) => config.with_model_context_window(w),
                None => config,
            };
            config.validate().map_err(|e| e.to_string())?;
            let items = load_transcript(&transcript)?;
            replay(&config, items, make_backend(backend, model)?).await?;
        }
    }
    Ok(())
}

fn make_backend(
    backend: Backend,
    model: Option<String>,
) -> Result<Arc<dyn SummaryBackend>, String> {
    Ok(match backend {
        Backend::Extractive => Arc::new(ExtractiveSummarizer::new()),
        Backend::Openrouter => {
            let summarizer = OpenRouterSummarizer::from_env().map_err(|e| e.to_string())?;
            Arc::new(match model {
                Some(m) => summarizer.with_model(m),
                None => summarizer,
            })
        }
    })
}

async fn replay(
    config: &ContextConfig,
    items: Vec<ConversationItem>,
    backend: Arc<dyn SummaryBackend>,
) -> Result<(), String> {
    let session = Session::from_config(config, backend).with_event_handler(Arc::new(LoggingHandler));
    info!(
        items = items.len(),
        window = config.model_context_window,
        backend = session.backend_name(),
        "replaying transcript"
    );

    for (index, item) in items.into_iter().enumerate() {
        let outcome = session.add_item(item).await;
        if outcome.compaction_required() {
            // Failures are reported through the handler; keep replaying.
            let _ = session.compact().await;
        }
        println!("{index}\t{}", session.snapshot().to_log_string());
    }

    print!("{}", session.audit_jsonl().await.map_err(|e| e.to_string())?);
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────

fn read_input(path: Option<&Path>) -> Result<String, String> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .map_err(|e| format!("failed to read '{}': {e}", p.display())),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            Ok(buf)
        }
    }
}

/// One [`ConversationItem`] per line. Missing estimates are filled in.
fn load_transcript(path: &Path) -> Result<Vec<ConversationItem>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read transcript '{}': {e}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let mut item: ConversationItem = serde_json::from_str(line)
                .map_err(|e| format!("{}:{}: {e}", path.display(), n + 1))?;
            if item.estimated_tokens == 0 {
                item.reestimate();
            }
            Ok(item)
        })
        .collect()
}
