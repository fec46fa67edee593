//! Conversion entry points.
//!
//! [`MarkdownEngine`] drives one document through the whole flow:
//!
//! ```text
//! input ──▶ materialize ──▶ select converter ──▶ workspace
//!       ──▶ convert ──▶ middleware chain ──▶ compose ──▶ dispose
//! ```
//!
//! Every conversion owns its materialized source, its [`PipelineContext`] and
//! its [`ArtifactWorkspace`]; nothing mutable is shared between conversions,
//! so [`MarkdownEngine::convert_many`] can run them concurrently. The
//! workspace is disposed and the materialized source released on every exit
//! path. When both the conversion and its cleanup fail, the conversion error
//! is returned and the cleanup error is logged.

use crate::cancel::CancellationToken;
use crate::compose;
use crate::config::ConversionConfig;
use crate::converter::{ConverterRegistry, SharedConverter};
use crate::diagnostics;
use crate::error::MdForgeError;
use crate::output::{ConversionResult, ConversionStats};
use crate::pipeline::{ConversionPipeline, PipelineContext};
use crate::segment::count_by_kind;
use crate::source::{DocumentStream, StreamInfo};
use crate::workspace::{ArtifactWorkspace, MaterializedSource, Materializer};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Name of the persisted final Markdown inside the workspace.
pub const MARKDOWN_ARTIFACT: &str = "document.md";

/// Returns `true` if `input` looks like an HTTP or HTTPS URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Converts documents to Markdown with a fixed configuration.
///
/// ```rust,no_run
/// use mdforge::{CancellationToken, ConversionConfig, MarkdownEngine};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = MarkdownEngine::new(ConversionConfig::default());
/// let result = engine
///     .convert_path("notes.md", &CancellationToken::new())
///     .await?;
/// println!("{}", result.markdown);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MarkdownEngine {
    config: ConversionConfig,
    registry: ConverterRegistry,
    pipeline: ConversionPipeline,
}

impl MarkdownEngine {
    /// Engine with the built-in converters.
    pub fn new(config: ConversionConfig) -> Self {
        Self::with_registry(config, ConverterRegistry::with_defaults())
    }

    pub fn with_registry(config: ConversionConfig, registry: ConverterRegistry) -> Self {
        let pipeline = ConversionPipeline::new(config.middleware.clone());
        Self {
            config,
            registry,
            pipeline,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    /// Convert an arbitrary stream described by `info`.
    pub async fn convert(
        &self,
        mut stream: DocumentStream,
        info: StreamInfo,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        let span = conversion_span(&info);
        self.tracked(
            async {
                let started = Instant::now();
                let default_extension = info
                    .normalized_extension()
                    .unwrap_or_else(|| ".bin".to_string());
                let source = self
                    .materializer()
                    .materialize(&mut stream, &info, &default_extension, cancel)
                    .await?;
                drop(stream);
                self.process(source, info, started, cancel).await
            }
            .instrument(span),
        )
        .await
    }

    /// Convert a local file. The file is read in place, never copied.
    pub async fn convert_path(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(MdForgeError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let stream = DocumentStream::open(path)
            .await
            .map_err(|e| MdForgeError::Materialization {
                path: path.to_path_buf(),
                source: e,
            })?;
        self.convert(stream, StreamInfo::from_path(path), cancel)
            .await
    }

    /// Download `url` to the workspace root and convert it.
    pub async fn convert_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        if !is_url(url) {
            return Err(MdForgeError::InvalidInput {
                input: url.to_string(),
            });
        }
        let span = info_span!("conversion", input = %url, workspace = tracing::field::Empty);
        self.tracked(
            async {
                let started = Instant::now();
                let (source, info) = self
                    .materializer()
                    .materialize_url(url, &StreamInfo::new(), self.config.download_timeout_secs, cancel)
                    .await?;
                self.process(source, info, started, cancel).await
            }
            .instrument(span),
        )
        .await
    }

    /// Convert standard input. `info` supplies whatever the caller knows
    /// about the bytes (usually an extension or mime type).
    pub async fn convert_stdin(
        &self,
        info: StreamInfo,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        let info = if info.filename.is_none() {
            info.with_filename("stdin")
        } else {
            info
        };
        self.convert(DocumentStream::sequential(tokio::io::stdin()), info, cancel)
            .await
    }

    /// Convert `-` (stdin), an HTTP(S) URL or a local path.
    pub async fn convert_input(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        if input == "-" {
            self.convert_stdin(StreamInfo::new(), cancel).await
        } else if is_url(input) {
            self.convert_url(input, cancel).await
        } else {
            self.convert_path(input, cancel).await
        }
    }

    /// Convert several inputs concurrently.
    ///
    /// At most `concurrency` conversions run at once. Results come back in
    /// input order; one failure does not affect the others.
    pub async fn convert_many<S: AsRef<str>>(
        &self,
        inputs: &[S],
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<Result<ConversionResult, MdForgeError>> {
        let mut results: Vec<(usize, Result<ConversionResult, MdForgeError>)> =
            stream::iter(inputs.iter().enumerate().map(|(i, input)| async move {
                (i, self.convert_input(input.as_ref(), cancel).await)
            }))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Convert `input` and write the Markdown to `output_path`.
    ///
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn convert_to_file(
        &self,
        input: &str,
        output_path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        let result = self.convert_input(input, cancel).await?;
        write_markdown(&result.markdown, output_path).await?;
        Ok(result)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn materializer(&self) -> Materializer {
        Materializer::new(self.config.materialize.clone())
            .with_progress(self.config.progress_sink.clone())
    }

    async fn tracked<F>(&self, conversion: F) -> Result<ConversionResult, MdForgeError>
    where
        F: std::future::Future<Output = Result<ConversionResult, MdForgeError>>,
    {
        diagnostics::conversion_started();
        let result = conversion.await;
        diagnostics::conversion_finished(&result);
        if let Err(e) = &result {
            if e.is_cancelled() {
                info!("Conversion cancelled: {}", e);
            } else {
                warn!("Conversion failed: {}", e);
            }
        }
        result
    }

    /// Everything after materialization. Releases `source` on every path.
    async fn process(
        &self,
        source: MaterializedSource,
        info: StreamInfo,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        let materialize_ms = started.elapsed().as_millis() as u64;
        let outcome = self
            .process_materialized(&source, info, started, materialize_ms, cancel)
            .await;
        let released = source.release();
        settle(outcome, released).map(|(result, ())| result)
    }

    async fn process_materialized(
        &self,
        source: &MaterializedSource,
        info: StreamInfo,
        started: Instant,
        materialize_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult, MdForgeError> {
        let info = if info.local_path.is_none() {
            info.with_local_path(source.path())
        } else {
            info
        };

        let converter = self.registry.select(source, &info).await?;
        let workspace = ArtifactWorkspace::create(
            &self.config.materialize.workspace_root,
            &info,
            &self.config.segment_options,
            &self.config.storage_options,
        )
        .await?;
        tracing::Span::current().record("workspace", tracing::field::display(workspace.id()));

        let mut ctx = PipelineContext::new(info)
            .with_segment_options(self.config.segment_options.clone())
            .with_provider(self.config.provider.clone())
            .with_progress(self.config.progress_sink.clone(), self.config.progress_detail)
            .with_source_path(source.path())
            .with_workspace(workspace);

        let mut stats = ConversionStats {
            converter: converter.name().to_string(),
            source_bytes: source.len(),
            source_copied: source.is_owned(),
            materialize_duration_ms: materialize_ms,
            ..ConversionStats::default()
        };
        let outcome = self
            .run_in_context(&converter, source, &mut ctx, &mut stats, cancel)
            .await;

        let disposed = match ctx.take_workspace() {
            Some(mut workspace) => workspace.dispose().await.map(|()| workspace.summary()),
            None => Err(MdForgeError::Internal(
                "workspace was removed from the pipeline context".into(),
            )),
        };
        let (markdown, summary) = settle(outcome, disposed)?;

        stats.segment_count = ctx.segments.len();
        stats.segments_by_kind = count_by_kind(&ctx.segments);
        stats.image_count = ctx.artifacts.images.len();
        stats.total_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Conversion complete: {} segment(s), {} image(s), {}ms total",
            stats.segment_count, stats.image_count, stats.total_duration_ms
        );

        Ok(ConversionResult {
            markdown,
            title: ctx.title.take(),
            segments: std::mem::take(&mut ctx.segments),
            artifacts: std::mem::take(&mut ctx.artifacts),
            workspace: summary,
            stats,
        })
    }

    /// Convert, enrich and compose inside `ctx`. Returns the final Markdown
    /// and leaves the resolved title in `ctx.title`.
    async fn run_in_context(
        &self,
        converter: &SharedConverter,
        source: &MaterializedSource,
        ctx: &mut PipelineContext,
        stats: &mut ConversionStats,
        cancel: &CancellationToken,
    ) -> Result<String, MdForgeError> {
        // ── Step 1: Keep a copy of the source ────────────────────────────
        if self.config.storage_options.copy_source_document {
            let name = source_artifact_name(&ctx.stream_info);
            if let Some(workspace) = ctx.workspace_mut() {
                workspace.persist_file(&name, source.path()).await?;
            }
        }

        // ── Step 2: Extract ──────────────────────────────────────────────
        let convert_start = Instant::now();
        let extracted = converter.convert(source, &ctx.stream_info, cancel).await?;
        stats.convert_duration_ms = convert_start.elapsed().as_millis() as u64;
        info!(
            "Converter '{}' produced {} segment(s) in {}ms",
            converter.name(),
            extracted.segments.len(),
            stats.convert_duration_ms
        );
        ctx.segments = extracted.segments;
        ctx.artifacts = extracted.artifacts;
        ctx.markdown = extracted.markdown;
        ctx.title = extracted.title;

        // ── Step 3: Middleware ───────────────────────────────────────────
        let pipeline_start = Instant::now();
        self.pipeline.execute(ctx, cancel).await?;
        stats.pipeline_duration_ms = pipeline_start.elapsed().as_millis() as u64;
        cancel.check("compose")?;

        // ── Step 4: Compose ──────────────────────────────────────────────
        let markdown = if ctx.segments.is_empty() {
            ctx.markdown.clone()
        } else {
            ctx.compose_markdown()
        };
        let title = ctx
            .title
            .take()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| compose::derive_title(&ctx.segments))
            .or_else(|| {
                ctx.segments
                    .is_empty()
                    .then(|| compose::title_from_markdown(&markdown))
                    .flatten()
            });
        ctx.title = title;

        // ── Step 5: Persist the result ───────────────────────────────────
        if self.config.storage_options.persist_markdown {
            if let Some(workspace) = ctx.workspace_mut() {
                workspace.persist_text(MARKDOWN_ARTIFACT, &markdown).await?;
            }
        }

        Ok(markdown)
    }
}

fn conversion_span(info: &StreamInfo) -> tracing::Span {
    let input = info
        .local_path
        .as_ref()
        .map(|p| p.display().to_string())
        .or_else(|| info.url.clone())
        .or_else(|| info.filename.clone())
        .unwrap_or_else(|| "<stream>".to_string());
    info_span!("conversion", input = %input, workspace = tracing::field::Empty)
}

/// `source<ext>`, or the input's own file name when it has one.
fn source_artifact_name(info: &StreamInfo) -> String {
    info.filename
        .as_deref()
        .and_then(|f| Path::new(f).file_name())
        .map(|f| f.to_string_lossy().into_owned())
        .filter(|f| !f.is_empty() && f != MARKDOWN_ARTIFACT)
        .unwrap_or_else(|| {
            format!(
                "source{}",
                info.normalized_extension().unwrap_or_default()
            )
        })
}

/// Combine a primary outcome with its cleanup outcome.
///
/// The primary error wins; a cleanup error only surfaces on success.
fn settle<T, U>(
    primary: Result<T, MdForgeError>,
    cleanup: Result<U, MdForgeError>,
) -> Result<(T, U), MdForgeError> {
    match (primary, cleanup) {
        (Ok(value), Ok(extra)) => Ok((value, extra)),
        (Err(e), Ok(_)) => Err(e),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(e), Err(cleanup)) => {
            warn!("Cleanup after failed conversion also failed: {}", cleanup);
            Err(e)
        }
    }
}

/// Write `markdown` to `path` atomically (temp file + rename).
pub async fn write_markdown(markdown: &str, path: impl AsRef<Path>) -> Result<(), MdForgeError> {
    let path = path.as_ref();
    let write_error = |e: std::io::Error| MdForgeError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
    }

    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, markdown)
        .await
        .map_err(write_error)?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(write_error(e));
    }

    debug!("Wrote {} bytes to {}", markdown.len(), path.display());
    Ok(())
}

/// Default output path for `input`: same stem, `.md` extension.
pub fn default_output_path(input: &str) -> PathBuf {
    let name = if is_url(input) {
        input
            .split(['?', '#'])
            .next()
            .and_then(|p| p.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("download")
    } else if input == "-" {
        "stdin"
    } else {
        input
    };
    let path = PathBuf::from(name);
    if path.extension().is_some_and(|e| e == "md") {
        path.with_extension("out.md")
    } else {
        path.with_extension("md")
    }
}
