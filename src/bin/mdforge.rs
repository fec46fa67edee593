//! CLI binary for mdforge.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_llm::ProviderFactory;
use indicatif::{ProgressBar, ProgressStyle};
use mdforge::convert::write_markdown;
use mdforge::{
    pipeline, ArtifactStorageOptions, CancellationToken, ConversionConfig, ConversionResult,
    MarkdownEngine, MaterializeOptions, MdForgeError, ProgressDetailLevel, ProgressEvent, ProgressSink,
    SegmentOptions, SharedProgressSink, StreamInfo,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress sink using indicatif ────────────────────────────────────────

/// Renders materialization bytes and segment counts on one bar.
///
/// Starts as a spinner and switches to a bar as soon as an event carries a
/// total.
struct CliProgressSink {
    bar: ProgressBar,
}

impl CliProgressSink {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for CliProgressSink {
    fn report(&self, event: &ProgressEvent) {
        if let Some(total) = event.total {
            if self.bar.length() != Some(total) {
                let unit = if event.stage == "materialize" {
                    "{bytes}/{total_bytes}"
                } else {
                    "{pos:>3}/{len}"
                };
                self.bar.set_style(
                    ProgressStyle::with_template(&format!(
                        "{{spinner:.cyan}} {{prefix:.bold}}  [{{bar:42.green/238}}] {unit}  {{msg}}"
                    ))
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▉▊▋▌▍▎▏  ")
                    .tick_strings(TICKS),
                );
                self.bar.set_length(total);
            }
        }
        self.bar.set_prefix(event.stage.clone());
        self.bar.set_position(event.completed);
        if let Some(details) = &event.details {
            self.bar.set_message(details.clone());
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert to stdout
  mdforge notes.md

  # Convert to file, with segment annotations
  mdforge --annotate report.txt -o report.md

  # Read from stdin (give the format explicitly)
  cat notes.txt | mdforge - --extension txt

  # Convert from URL and keep the artifact workspace
  mdforge https://example.com/README.md --keep-artifacts --artifacts-dir ./work

  # Describe extracted images with a vision model
  mdforge --captions --provider openai --model gpt-4.1-nano doc.md

ENVIRONMENT VARIABLES:
  RUST_LOG                Log filter (overrides --verbose)
  OPENAI_API_KEY          OpenAI API key (for --captions)
  ANTHROPIC_API_KEY       Anthropic API key (for --captions)
  GEMINI_API_KEY          Google Gemini API key (for --captions)
"#;

/// Convert documents, URLs and stdin to Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "mdforge",
    version,
    about = "Convert documents, URLs and stdin to Markdown",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file path, HTTP/HTTPS URL, or `-` for stdin.
    input: String,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "MDFORGE_OUTPUT")]
    output: Option<PathBuf>,

    /// Prefix every segment with a `[page:N]`-style annotation line.
    #[arg(long, env = "MDFORGE_ANNOTATE")]
    annotate: bool,

    /// Keep the per-conversion artifact directory after the run.
    #[arg(long, env = "MDFORGE_KEEP_ARTIFACTS")]
    keep_artifacts: bool,

    /// Report progress per segment instead of once per stage.
    #[arg(long, env = "MDFORGE_DETAILED")]
    detailed: bool,

    /// Parent directory for materialized sources and workspaces.
    #[arg(long, env = "MDFORGE_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    /// Format hint for stdin input (e.g. `md`, `txt`).
    #[arg(long)]
    extension: Option<String>,

    /// Persist the final Markdown and a copy of the source into the workspace.
    #[arg(long)]
    persist: bool,

    /// Describe extracted images with a vision LLM.
    #[arg(long)]
    captions: bool,

    /// LLM provider for --captions: openai, anthropic, gemini, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID for --captions.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Output structured JSON (ConversionResult) instead of Markdown.
    #[arg(long)]
    json: bool,

    /// Copy buffer size in bytes.
    #[arg(long, default_value_t = mdforge::config::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "MDFORGE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MDFORGE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose asks for them.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = show_progress.then(CliProgressSink::new);
    let config = build_config(&cli, progress.clone().map(|p| p as SharedProgressSink))?;
    let engine = MarkdownEngine::new(config);

    // ── Cancellation on Ctrl-C ───────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // ── Run conversion ───────────────────────────────────────────────────
    let result = run(&cli, &engine, &cancel).await;
    if let Some(p) = &progress {
        p.finish();
    }
    let result = result.context("Conversion failed")?;

    if let Some(ref output_path) = cli.output {
        if !cli.quiet {
            eprintln!(
                "{}  {} segments  {}ms  →  {}",
                green("✔"),
                result.stats.segment_count,
                result.stats.total_duration_ms,
                bold(&output_path.display().to_string()),
            );
        }
    } else if cli.json {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(result.markdown.as_bytes())
            .context("Failed to write to stdout")?;
        if !result.markdown.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if !cli.quiet && !cli.json {
        print_summary(&result, cli.keep_artifacts);
    }
    Ok(())
}

async fn run(
    cli: &Cli,
    engine: &MarkdownEngine,
    cancel: &CancellationToken,
) -> std::result::Result<ConversionResult, MdForgeError> {
    let result = if cli.input == "-" {
        let info = match &cli.extension {
            Some(ext) => StreamInfo::new().with_extension(ext.clone()),
            None => StreamInfo::new(),
        };
        engine.convert_stdin(info, cancel).await?
    } else {
        engine.convert_input(&cli.input, cancel).await?
    };
    if let Some(ref output_path) = cli.output {
        write_markdown(&result.markdown, output_path).await?;
    }
    Ok(result)
}

fn print_summary(result: &ConversionResult, kept: bool) {
    let kinds: Vec<String> = result
        .stats
        .segments_by_kind
        .iter()
        .map(|(kind, n)| format!("{}={}", kind.name(), n))
        .collect();
    eprintln!(
        "   {} via {}  {}",
        dim(&kinds.join(", ")),
        result.stats.converter,
        dim(&format!("{} bytes", result.stats.source_bytes)),
    );
    if let Some(title) = &result.title {
        eprintln!("   title: {}", bold(title));
    }
    if kept {
        eprintln!(
            "   artifacts: {}",
            result.workspace.directory.display()
        );
    }
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, progress: Option<SharedProgressSink>) -> Result<ConversionConfig> {
    let mut materialize = MaterializeOptions {
        buffer_size: cli.buffer_size,
        ..MaterializeOptions::default()
    };
    if let Some(dir) = &cli.artifacts_dir {
        materialize.workspace_root = dir.clone();
    }

    let mut builder = ConversionConfig::builder()
        .segment_options(SegmentOptions {
            include_segment_metadata_in_markdown: cli.annotate,
            keep_artifact_directory: cli.keep_artifacts,
        })
        .storage_options(ArtifactStorageOptions {
            persist_markdown: cli.persist,
            copy_source_document: cli.persist,
            ..ArtifactStorageOptions::default()
        })
        .materialize_options(materialize)
        .progress_detail(if cli.detailed {
            ProgressDetailLevel::Detailed
        } else {
            ProgressDetailLevel::Basic
        })
        .download_timeout_secs(cli.download_timeout);

    for stage in pipeline::standard_middleware() {
        builder = builder.middleware(stage);
    }
    if let Some(sink) = progress {
        builder = builder.progress_sink(sink);
    }
    if cli.captions {
        let name = cli.provider.as_deref().unwrap_or("openai");
        let model = cli.model.as_deref().unwrap_or("gpt-4.1-nano");
        let provider = ProviderFactory::create_llm_provider(name, model)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("Failed to create provider '{name}'"))?;
        builder = builder.provider(provider);
    }

    builder.build().context("Invalid configuration")
}
