//! Post-extraction middleware chain.
//!
//! A converter hands back raw segments and artifacts; the pipeline then runs
//! an ordered list of [`ConversionMiddleware`] over one mutable
//! [`PipelineContext`]. The final Markdown is composed from whatever the
//! context holds once the chain finishes.
//!
//! ## Data Flow
//!
//! ```text
//! converter ──▶ [stage 0] ──▶ [stage 1] ──▶ … ──▶ [stage N-1] ──▶ compose
//!               (segments, artifacts, workspace mutated in place)
//! ```
//!
//! Execution is strictly sequential in registration order; later stages may
//! read what earlier ones wrote. The first failing stage aborts the rest and
//! its error reaches the caller wrapped in [`MdForgeError::Middleware`] with
//! the stage name and index. Cancellation is checked before every stage and
//! inside the long-running standard stages. Mutations already applied are
//! kept, so a cancelled context is partially enriched but consistent.
//!
//! Standard stages:
//!
//! 1. [`postprocess`] - deterministic Markdown cleanup per segment
//! 2. [`artifacts`]  - persist image artifacts into the workspace
//! 3. [`caption`]    - provider-backed image descriptions
//! 4. [`progress`]   - segment progress events

pub mod artifacts;
pub mod caption;
pub mod postprocess;
pub mod progress;

use crate::cancel::CancellationToken;
use crate::compose;
use crate::config::SegmentOptions;
use crate::error::MdForgeError;
use crate::progress::{ProgressDetailLevel, SharedProgressSink};
use crate::segment::{ConversionArtifacts, DocumentSegment};
use crate::source::StreamInfo;
use crate::workspace::ArtifactWorkspace;
use async_trait::async_trait;
use edgequake_llm::LLMProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// One enrichment step run after extraction.
#[async_trait]
pub trait ConversionMiddleware: Send + Sync {
    /// Stable stage name, used in errors, logs and duplicate detection.
    fn name(&self) -> &str;

    /// Read and mutate `ctx` in place.
    ///
    /// Implementations that loop over many segments should call
    /// `cancel.check(..)` as they go.
    async fn invoke(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), MdForgeError>;
}

/// Shared handle stored in [`crate::config::ConversionConfig`].
pub type SharedMiddleware = Arc<dyn ConversionMiddleware>;

/// The standard stages in their documented order.
pub fn standard_middleware() -> Vec<SharedMiddleware> {
    vec![
        Arc::new(postprocess::MarkdownCleanupMiddleware),
        Arc::new(artifacts::ArtifactPersistenceMiddleware),
        Arc::new(caption::ImageCaptionMiddleware::new()),
        Arc::new(progress::SegmentProgressMiddleware),
    ]
}

/// Where a pipeline run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Running { index: usize },
    Completed,
    Failed { index: usize },
    Cancelled { index: usize },
}

/// Mutable per-conversion state shared by every middleware stage.
///
/// Owned by exactly one conversion; never shared across conversions.
pub struct PipelineContext {
    pub stream_info: StreamInfo,
    /// Ordered segments. Stages may edit, append or remove, never re-sort.
    pub segments: Vec<DocumentSegment>,
    pub artifacts: ConversionArtifacts,
    /// Markdown returned by the converter; used when there are no segments.
    pub markdown: String,
    pub title: Option<String>,
    segment_options: SegmentOptions,
    provider: Option<Arc<dyn LLMProvider>>,
    progress: Option<SharedProgressSink>,
    progress_detail: ProgressDetailLevel,
    workspace: Option<ArtifactWorkspace>,
    source_path: Option<PathBuf>,
    span: tracing::Span,
    state: PipelineState,
}

impl PipelineContext {
    pub fn new(stream_info: StreamInfo) -> Self {
        Self {
            stream_info,
            segments: Vec::new(),
            artifacts: ConversionArtifacts::default(),
            markdown: String::new(),
            title: None,
            segment_options: SegmentOptions::default(),
            provider: None,
            progress: None,
            progress_detail: ProgressDetailLevel::default(),
            workspace: None,
            source_path: None,
            span: tracing::Span::current(),
            state: PipelineState::Idle,
        }
    }

    pub fn with_segments(mut self, segments: Vec<DocumentSegment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ConversionArtifacts) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_segment_options(mut self, options: SegmentOptions) -> Self {
        self.segment_options = options;
        self
    }

    pub fn with_provider(mut self, provider: Option<Arc<dyn LLMProvider>>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_progress(
        mut self,
        sink: Option<SharedProgressSink>,
        detail: ProgressDetailLevel,
    ) -> Self {
        self.progress = sink;
        self.progress_detail = detail;
        self
    }

    pub fn with_workspace(mut self, workspace: ArtifactWorkspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Attach the conversion's tracing span; stage spans are its children.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn segment_options(&self) -> &SegmentOptions {
        &self.segment_options
    }

    pub fn provider(&self) -> Option<&Arc<dyn LLMProvider>> {
        self.provider.as_ref()
    }

    pub fn progress_sink(&self) -> Option<&SharedProgressSink> {
        self.progress.as_ref()
    }

    pub fn progress_detail(&self) -> ProgressDetailLevel {
        self.progress_detail
    }

    pub fn workspace(&self) -> Option<&ArtifactWorkspace> {
        self.workspace.as_ref()
    }

    pub fn workspace_mut(&mut self) -> Option<&mut ArtifactWorkspace> {
        self.workspace.as_mut()
    }

    /// Hand the workspace back to the owner for disposal.
    pub fn take_workspace(&mut self) -> Option<ArtifactWorkspace> {
        self.workspace.take()
    }

    pub fn set_workspace(&mut self, workspace: ArtifactWorkspace) {
        self.workspace = Some(workspace);
    }

    /// The materialized source file, when one exists.
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Logger handle for this conversion.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Compose Markdown from the current segments.
    ///
    /// Always recomputed, so edits made by any stage are reflected.
    pub fn compose_markdown(&self) -> String {
        compose::compose(&self.segments, &self.segment_options)
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("stream_info", &self.stream_info)
            .field("segments", &self.segments.len())
            .field("images", &self.artifacts.images.len())
            .field("workspace", &self.workspace)
            .field("state", &self.state)
            .finish()
    }
}

/// A fixed, ordered chain of middleware.
#[derive(Clone, Default)]
pub struct ConversionPipeline {
    stages: Vec<SharedMiddleware>,
}

impl ConversionPipeline {
    pub fn new(stages: Vec<SharedMiddleware>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order against `ctx`.
    ///
    /// Stops at the first error. The returned error is
    /// [`MdForgeError::Middleware`], naming the failing stage and keeping the
    /// stage's own error, unchanged, as its source. Callers that care about
    /// what went wrong rather than where should match on
    /// [`MdForgeError::root`], which yields the stage's error exactly as it
    /// was returned.
    pub async fn execute(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), MdForgeError> {
        let total = self.stages.len();
        if total > 0 {
            info!("Running {} middleware stage(s)", total);
        }

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name().to_string();
            let span = tracing::info_span!(parent: ctx.span(), "middleware", stage = %name, index);

            let outcome = match cancel.check(&name) {
                Ok(()) => {
                    ctx.state = PipelineState::Running { index };
                    debug!("Stage {}/{}: {}", index + 1, total, name);
                    stage.invoke(ctx, cancel).instrument(span).await
                }
                Err(e) => Err(e),
            };

            if let Err(source) = outcome {
                ctx.state = if source.is_cancelled() {
                    info!("Pipeline cancelled at stage {} ({})", index, name);
                    PipelineState::Cancelled { index }
                } else {
                    warn!("Stage {} ({}) failed: {}", index, name, source);
                    PipelineState::Failed { index }
                };
                return Err(MdForgeError::Middleware {
                    stage: name,
                    index,
                    source: Box::new(source),
                });
            }
        }

        ctx.state = PipelineState::Completed;
        Ok(())
    }
}

impl std::fmt::Debug for ConversionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
