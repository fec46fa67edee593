//! Configuration types for document conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. The nested option groups
//! ([`SegmentOptions`], [`ArtifactStorageOptions`], [`MaterializeOptions`])
//! are plain value types: construct them directly with struct-update syntax
//! and hand them to the builder whole.
//!
//! ```rust
//! use mdforge::{ConversionConfig, SegmentOptions, ProgressDetailLevel};
//!
//! let config = ConversionConfig::builder()
//!     .segment_options(SegmentOptions {
//!         include_segment_metadata_in_markdown: true,
//!         ..SegmentOptions::default()
//!     })
//!     .progress_detail(ProgressDetailLevel::Detailed)
//!     .build()
//!     .unwrap();
//! assert!(config.segment_options.include_segment_metadata_in_markdown);
//! ```

use crate::error::MdForgeError;
use crate::pipeline::SharedMiddleware;
use crate::progress::{ProgressDetailLevel, SharedProgressSink};
use crate::source::StreamInfo;
use crate::workspace::storage::{SharedStorage, StorageError};
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default copy buffer for materialization: large sequential writes.
pub const DEFAULT_BUFFER_SIZE: usize = 81_920;

/// Options shaping segments and their Markdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentOptions {
    /// Prefix every emitted segment with a `[kind:N]…` annotation line.
    pub include_segment_metadata_in_markdown: bool,
    /// Keep the local artifact directory after the conversion ends.
    pub keep_artifact_directory: bool,
}

/// Builds the storage client for one workspace.
pub type StorageFactory =
    Arc<dyn Fn(&StreamInfo) -> Result<SharedStorage, StorageError> + Send + Sync>;

/// Options for persisting artifacts and mirroring them to storage.
#[derive(Clone)]
pub struct ArtifactStorageOptions {
    /// Storage client factory. `None` keeps artifacts on the local disk only.
    pub storage_factory: Option<StorageFactory>,
    /// Remove uploaded objects under the workspace prefix on dispose.
    pub delete_on_dispose: bool,
    /// Dispose the storage client itself on workspace dispose.
    pub dispose_storage: bool,
    /// Persist the composed Markdown as `document.md`.
    pub persist_markdown: bool,
    /// Copy the materialized source into the workspace.
    pub copy_source_document: bool,
    /// Remote prefix under which each workspace gets its own directory.
    pub storage_prefix: String,
}

impl Default for ArtifactStorageOptions {
    fn default() -> Self {
        Self {
            storage_factory: None,
            delete_on_dispose: false,
            dispose_storage: false,
            persist_markdown: false,
            copy_source_document: false,
            storage_prefix: "mdforge".to_string(),
        }
    }
}

impl fmt::Debug for ArtifactStorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStorageOptions")
            .field(
                "storage_factory",
                &self.storage_factory.as_ref().map(|_| "<dyn Fn>"),
            )
            .field("delete_on_dispose", &self.delete_on_dispose)
            .field("dispose_storage", &self.dispose_storage)
            .field("persist_markdown", &self.persist_markdown)
            .field("copy_source_document", &self.copy_source_document)
            .field("storage_prefix", &self.storage_prefix)
            .finish()
    }
}

/// Options for copying inputs to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeOptions {
    /// Copy buffer size in bytes. Default: 81 920.
    pub buffer_size: usize,
    /// Parent directory for per-conversion workspaces. Default: `<tmp>/mdforge`.
    pub workspace_root: PathBuf,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            workspace_root: std::env::temp_dir().join("mdforge"),
        }
    }
}

/// Configuration for a document conversion.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
#[derive(Clone)]
pub struct ConversionConfig {
    pub segment_options: SegmentOptions,
    pub storage_options: ArtifactStorageOptions,
    pub materialize: MaterializeOptions,
    /// Verbosity of segment progress events. Default: Basic.
    pub progress_detail: ProgressDetailLevel,
    /// Middleware run after extraction, in exactly this order.
    pub middleware: Vec<SharedMiddleware>,
    /// Receives progress events. `None` disables reporting.
    pub progress_sink: Option<SharedProgressSink>,
    /// Provider handed to middleware through the pipeline context.
    pub provider: Option<Arc<dyn LLMProvider>>,
    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            segment_options: SegmentOptions::default(),
            storage_options: ArtifactStorageOptions::default(),
            materialize: MaterializeOptions::default(),
            progress_detail: ProgressDetailLevel::default(),
            middleware: Vec::new(),
            progress_sink: None,
            provider: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<&str> = self.middleware.iter().map(|m| m.name()).collect();
        f.debug_struct("ConversionConfig")
            .field("segment_options", &self.segment_options)
            .field("storage_options", &self.storage_options)
            .field("materialize", &self.materialize)
            .field("progress_detail", &self.progress_detail)
            .field("middleware", &stages)
            .field("progress_sink", &self.progress_sink.as_ref().map(|_| "<dyn ProgressSink>"))
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("download_timeout_secs", &self.download_timeout_secs)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn segment_options(mut self, options: SegmentOptions) -> Self {
        self.config.segment_options = options;
        self
    }

    pub fn storage_options(mut self, options: ArtifactStorageOptions) -> Self {
        self.config.storage_options = options;
        self
    }

    pub fn materialize_options(mut self, options: MaterializeOptions) -> Self {
        self.config.materialize = options;
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.materialize.workspace_root = root.into();
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.config.materialize.buffer_size = bytes;
        self
    }

    pub fn progress_detail(mut self, level: ProgressDetailLevel) -> Self {
        self.config.progress_detail = level;
        self
    }

    /// Append a middleware; stages run in the order they were added.
    pub fn middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.config.middleware.push(middleware);
        self
    }

    pub fn progress_sink(mut self, sink: SharedProgressSink) -> Self {
        self.config.progress_sink = Some(sink);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, MdForgeError> {
        let c = &self.config;
        if c.materialize.buffer_size == 0 {
            return Err(MdForgeError::InvalidConfig(
                "Materialize buffer size must be ≥ 1 byte".into(),
            ));
        }
        if c.materialize.workspace_root.as_os_str().is_empty() {
            return Err(MdForgeError::InvalidConfig(
                "Workspace root must not be empty".into(),
            ));
        }
        if c.download_timeout_secs == 0 {
            return Err(MdForgeError::InvalidConfig(
                "Download timeout must be ≥ 1 second".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for m in &c.middleware {
            if !seen.insert(m.name().to_string()) {
                return Err(MdForgeError::InvalidConfig(format!(
                    "Middleware '{}' registered twice",
                    m.name()
                )));
            }
        }
        Ok(self.config)
    }
}
