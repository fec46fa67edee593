//! Error types for the mdforge library.
//!
//! Every fatal failure surfaces as [`MdForgeError`]. The variants follow the
//! four failure families of a conversion:
//!
//! * **Materialization**: copying an input stream to disk failed. Whatever
//!   the attempt created has already been removed when the error reaches the
//!   caller.
//! * **Middleware**: a pipeline stage failed. The stage name and index are
//!   attached and the stage's own error is kept as the `source`, so callers
//!   can match on the original failure.
//! * **Storage**: a remote artifact operation failed. Local cleanup still
//!   ran.
//! * **Cancellation**: the caller's [`crate::cancel::CancellationToken`]
//!   fired. Cleanup guarantees are the same as for any other failure.
//!
//! The core never retries. Retry and backoff belong to the caller.

use crate::workspace::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the mdforge library.
#[derive(Debug, Error)]
pub enum MdForgeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Materialization ───────────────────────────────────────────────────
    /// Copying the source stream to disk failed; partial output was removed.
    #[error("Failed to materialize source to '{path}': {source}")]
    Materialization {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Conversion ────────────────────────────────────────────────────────
    /// No registered converter accepted the input.
    #[error("No converter accepts input (mime: {mime}, extension: {extension})")]
    NoConverter { mime: String, extension: String },

    /// A converter failed while extracting content.
    #[error("Converter '{converter}' failed: {message}")]
    Converter { converter: String, message: String },

    /// A middleware stage failed; remaining stages were skipped.
    #[error("Middleware '{stage}' (stage {index}) failed: {source}")]
    Middleware {
        stage: String,
        index: usize,
        #[source]
        source: Box<MdForgeError>,
    },

    /// An external provider call failed inside a middleware or converter.
    #[error("Provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// Cooperative cancellation was observed.
    #[error("Conversion cancelled during '{stage}'")]
    Cancelled { stage: String },

    // ── Workspace / storage ───────────────────────────────────────────────
    /// A workspace file operation failed.
    #[error("Workspace I/O failed for '{path}': {source}")]
    WorkspaceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Artifact names must be relative, non-empty and stay inside the workspace.
    #[error("Invalid artifact name '{name}'")]
    InvalidArtifactName { name: String },

    /// The workspace is append-only; an artifact with this name already exists.
    #[error("Artifact '{name}' already exists in workspace {workspace}")]
    ArtifactExists { name: String, workspace: String },

    /// The workspace was already disposed.
    #[error("Workspace {workspace} has been disposed")]
    WorkspaceDisposed { workspace: String },

    /// A remote storage operation failed.
    #[error("Storage {operation} failed for '{key}': {source}")]
    Storage {
        operation: &'static str,
        key: String,
        #[source]
        source: StorageError,
    },

    /// Workspace disposal completed with at least one failed cleanup step.
    ///
    /// Local and remote cleanup are independent: both were attempted.
    #[error("Workspace {workspace} cleanup failed: {}", cleanup_summary(.local, .remote))]
    Cleanup {
        workspace: String,
        local: Option<std::io::Error>,
        remote: Option<StorageError>,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MdForgeError {
    /// True when this error (or the stage error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            MdForgeError::Cancelled { .. } => true,
            MdForgeError::Middleware { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Name of the middleware stage that failed, if any.
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            MdForgeError::Middleware { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// The innermost error, skipping middleware stage annotations.
    pub fn root(&self) -> &MdForgeError {
        match self {
            MdForgeError::Middleware { source, .. } => source.root(),
            other => other,
        }
    }
}

fn cleanup_summary(local: &Option<std::io::Error>, remote: &Option<StorageError>) -> String {
    match (local, remote) {
        (Some(l), Some(r)) => format!("local: {l}; remote: {r}"),
        (Some(l), None) => format!("local: {l}"),
        (None, Some(r)) => format!("remote: {r}"),
        (None, None) => "no failures recorded".to_string(),
    }
}
