//! # mdforge
//!
//! Disk-first document-to-Markdown conversion core.
//!
//! ## Why this crate?
//!
//! Converters for real document formats (PDF, Office, audio transcripts)
//! need random access to their input, produce side files such as extracted
//! images, and are followed by enrichment steps that call external
//! providers. This crate supplies the plumbing they share: it puts every
//! input on disk, gives each conversion its own artifact workspace, runs an
//! ordered middleware chain over the extracted segments and composes the
//! final Markdown from whatever the chain left behind.
//!
//! ## Pipeline Overview
//!
//! ```text
//! input (path / stream / stdin / URL)
//!  │
//!  ├─ 1. Materialize  copy to <root>/src-…/ or borrow an existing file
//!  ├─ 2. Select       first converter (by priority) that accepts the input
//!  ├─ 3. Workspace    <root>/<uuid>/, optionally mirrored to storage
//!  ├─ 4. Convert      segments + image artifacts
//!  ├─ 5. Middleware   cleanup → persist images → captions → progress …
//!  ├─ 6. Compose      annotated Markdown from the current segments
//!  └─ 7. Dispose      remote + local cleanup on every exit path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mdforge::{pipeline, CancellationToken, ConversionConfig, MarkdownEngine, SegmentOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut builder = ConversionConfig::builder().segment_options(SegmentOptions {
//!         include_segment_metadata_in_markdown: true,
//!         ..SegmentOptions::default()
//!     });
//!     for stage in pipeline::standard_middleware() {
//!         builder = builder.middleware(stage);
//!     }
//!     let engine = MarkdownEngine::new(builder.build()?);
//!
//!     let result = engine
//!         .convert_input("notes.md", &CancellationToken::new())
//!         .await?;
//!     println!("{}", result.markdown);
//!     eprintln!("{} segments via {}", result.stats.segment_count, result.stats.converter);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mdforge` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! mdforge = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod compose;
pub mod config;
pub mod convert;
pub mod converter;
pub mod diagnostics;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod segment;
pub mod source;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancellationToken;
pub use compose::{compose, derive_title};
pub use config::{
    ArtifactStorageOptions, ConversionConfig, ConversionConfigBuilder, MaterializeOptions,
    SegmentOptions, StorageFactory,
};
pub use convert::MarkdownEngine;
pub use converter::{ConverterRegistry, DocumentConverter, ExtractedDocument, PlainTextConverter};
pub use error::MdForgeError;
pub use output::{ConversionResult, ConversionStats};
pub use pipeline::{ConversionMiddleware, ConversionPipeline, PipelineContext, SharedMiddleware};
pub use progress::{
    ProgressDetailLevel, ProgressEvent, ProgressSink, RecordingProgressSink, SharedProgressSink,
};
pub use segment::{ConversionArtifacts, DocumentSegment, ImageArtifact, SegmentKind};
pub use source::{DocumentStream, StreamInfo};
pub use workspace::{
    ArtifactStorage, ArtifactWorkspace, FileSystemStorage, MaterializedSource, Materializer,
    MemoryStorage, StorageError,
};
