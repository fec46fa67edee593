//! Materialization: persist any input stream to a file on disk.
//!
//! Converters want a stable, re-openable file rather than a one-shot stream.
//! [`Materializer::materialize`] gives them one:
//!
//! * **Fast path.** When the input already lives on disk (an existing
//!   `StreamInfo::local_path`, or a file-backed stream whose path exists) the
//!   returned handle *borrows* that path. Nothing is copied and nothing will
//!   be deleted.
//! * **Slow path.** Otherwise the stream is copied into a fresh directory
//!   under the workspace root with large buffered sequential writes. The
//!   handle *owns* that directory and removes it on release or drop.
//!
//! Seekable sources get their position restored after the copy, whether the
//! copy succeeded or not. A failed or cancelled copy removes the partial file
//! and its directory before the error is returned, so no caller ever sees a
//! half-written source.
//!
//! Which path ran is an optimisation detail: callers only rely on
//! [`MaterializedSource::path`] holding the complete source bytes.

use crate::cancel::CancellationToken;
use crate::config::MaterializeOptions;
use crate::diagnostics;
use crate::error::MdForgeError;
use crate::progress::{self, ProgressEvent, SharedProgressSink};
use crate::source::{DocumentStream, StreamInfo};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

const STAGE: &str = "materialize";

enum Ownership {
    /// Pre-existing file; never deleted here.
    Borrowed,
    /// Directory created by this materialization. `None` once released.
    Owned(Option<TempDir>),
}

/// A source document available as a file on disk.
///
/// Owned handles delete their directory when [`release`](Self::release)d or
/// dropped, whichever comes first.
pub struct MaterializedSource {
    path: PathBuf,
    len: u64,
    ownership: Ownership,
}

impl MaterializedSource {
    /// Path to the complete source bytes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when this handle created the file and will delete it.
    pub fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Owned(_))
    }

    /// Open the file for shared, sequential reading.
    pub async fn open(&self) -> std::io::Result<BufReader<File>> {
        open_shared(&self.path).await
    }

    /// Delete owned files now. Borrowed handles are left untouched.
    pub fn release(mut self) -> Result<(), MdForgeError> {
        self.release_in_place()
    }

    fn release_in_place(&mut self) -> Result<(), MdForgeError> {
        if let Ownership::Owned(dir) = &mut self.ownership {
            if let Some(dir) = dir.take() {
                let dir_path = dir.path().to_path_buf();
                dir.close().map_err(|e| MdForgeError::WorkspaceIo {
                    path: dir_path.clone(),
                    source: e,
                })?;
                debug!("Released materialized source {}", dir_path.display());
            }
        }
        Ok(())
    }
}

impl Drop for MaterializedSource {
    fn drop(&mut self) {
        if let Err(e) = self.release_in_place() {
            warn!("Failed to remove materialized source: {}", e);
        }
    }
}

impl std::fmt::Debug for MaterializedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedSource")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("owned", &self.is_owned())
            .finish()
    }
}

/// Open `path` read-only for sequential scans.
///
/// No lock is taken, so a format parser and a checksum pass can read the same
/// file concurrently.
pub async fn open_shared(path: impl AsRef<Path>) -> std::io::Result<BufReader<File>> {
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .open(path.as_ref())
        .await?;
    Ok(BufReader::with_capacity(crate::config::DEFAULT_BUFFER_SIZE, file))
}

/// Copies input streams into owned workspace files.
#[derive(Clone)]
pub struct Materializer {
    options: MaterializeOptions,
    progress: Option<SharedProgressSink>,
}

impl Materializer {
    pub fn new(options: MaterializeOptions) -> Self {
        Self {
            options,
            progress: None,
        }
    }

    /// Report `"materialize"` byte counts to `sink`.
    pub fn with_progress(mut self, sink: Option<SharedProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn options(&self) -> &MaterializeOptions {
        &self.options
    }

    /// Make `stream` available as a file on disk.
    ///
    /// `default_extension` names the copy (`source<ext>`) when `info` carries
    /// no filename.
    pub async fn materialize(
        &self,
        stream: &mut DocumentStream,
        info: &StreamInfo,
        default_extension: &str,
        cancel: &CancellationToken,
    ) -> Result<MaterializedSource, MdForgeError> {
        cancel.check(STAGE)?;

        if let Some(borrowed) = self.borrow_existing(stream, info).await {
            return Ok(borrowed);
        }

        let dir = self.create_dir()?;
        let path = dir.path().join(output_file_name(info, default_extension));

        let copied = match stream {
            DocumentStream::File { file, .. } => {
                let total = match file.metadata().await {
                    Ok(meta) => Some(meta.len()),
                    Err(_) => None,
                };
                self.copy_preserving_position(file, &path, total, cancel).await
            }
            DocumentStream::Seekable(reader) => {
                self.copy_preserving_position(reader.as_mut(), &path, None, cancel)
                    .await
            }
            DocumentStream::Sequential(reader) => {
                self.copy_into(reader.as_mut(), &path, None, cancel).await
            }
        };

        self.finish(dir, path, copied)
    }

    /// Download `url` into an owned file, streaming the body chunk by chunk.
    ///
    /// Returns the handle plus `info` enriched with the url, the filename
    /// inferred from the URL path and the response content type.
    pub async fn materialize_url(
        &self,
        url: &str,
        info: &StreamInfo,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<(MaterializedSource, StreamInfo), MdForgeError> {
        cancel.check(STAGE)?;
        info!("Downloading source from: {}", url);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| MdForgeError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let download_error = |e: reqwest::Error| {
            if e.is_timeout() {
                MdForgeError::DownloadTimeout {
                    url: url.to_string(),
                    secs: timeout_secs,
                }
            } else {
                MdForgeError::DownloadFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let mut response = client.get(url).send().await.map_err(download_error)?;
        if !response.status().is_success() {
            return Err(MdForgeError::DownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let mut enriched = info.clone().with_url(url);
        if enriched.filename.is_none() {
            if let Some(name) = filename_from_url(url) {
                enriched = enriched.with_filename(name);
            }
        }
        if enriched.mime_type.is_none() {
            if let Some(ct) = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                enriched = enriched.with_mime_type(ct);
            }
        }
        let total = response.content_length();

        let dir = self.create_dir()?;
        let path = dir.path().join(output_file_name(&enriched, ".bin"));

        let copied = async {
            let file = create_output(&path).await?;
            let mut writer = BufWriter::with_capacity(self.options.buffer_size, file);
            let mut written = 0u64;
            while let Some(chunk) = response.chunk().await.map_err(download_error)? {
                cancel.check(STAGE)?;
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| materialization_error(&path, e))?;
                written += chunk.len() as u64;
                self.report(written, total);
            }
            writer
                .flush()
                .await
                .map_err(|e| materialization_error(&path, e))?;
            Ok::<u64, MdForgeError>(written)
        }
        .await;

        let handle = self.finish(dir, path, copied)?;
        Ok((handle, enriched))
    }

    async fn borrow_existing(
        &self,
        stream: &DocumentStream,
        info: &StreamInfo,
    ) -> Option<MaterializedSource> {
        let candidates = [info.local_path.as_deref(), stream.backing_path()];
        for candidate in candidates.into_iter().flatten() {
            if let Ok(meta) = tokio::fs::metadata(candidate).await {
                if meta.is_file() {
                    debug!("Using existing file {} without copying", candidate.display());
                    return Some(MaterializedSource {
                        path: candidate.to_path_buf(),
                        len: meta.len(),
                        ownership: Ownership::Borrowed,
                    });
                }
            }
        }
        None
    }

    fn create_dir(&self) -> Result<TempDir, MdForgeError> {
        let root = &self.options.workspace_root;
        std::fs::create_dir_all(root).map_err(|e| MdForgeError::WorkspaceIo {
            path: root.clone(),
            source: e,
        })?;
        tempfile::Builder::new()
            .prefix("src-")
            .tempdir_in(root)
            .map_err(|e| MdForgeError::WorkspaceIo {
                path: root.clone(),
                source: e,
            })
    }

    /// Turn a copy outcome into a handle, or discard everything it created.
    fn finish(
        &self,
        dir: TempDir,
        path: PathBuf,
        copied: Result<u64, MdForgeError>,
    ) -> Result<MaterializedSource, MdForgeError> {
        match copied {
            Ok(len) => {
                diagnostics::file_materialized(len);
                debug!("Materialized {} bytes to {}", len, path.display());
                Ok(MaterializedSource {
                    path,
                    len,
                    ownership: Ownership::Owned(Some(dir)),
                })
            }
            Err(e) => {
                let dir_path = dir.path().to_path_buf();
                if let Err(cleanup) = dir.close() {
                    warn!(
                        "Failed to remove partial materialization {}: {}",
                        dir_path.display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn copy_preserving_position<R>(
        &self,
        reader: &mut R,
        path: &Path,
        total: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, MdForgeError>
    where
        R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        let start = reader
            .stream_position()
            .await
            .map_err(|e| materialization_error(path, e))?;
        let remaining = total.map(|t| t.saturating_sub(start));

        let copied = self.copy_into(reader, path, remaining, cancel).await;
        let restored = reader.seek(SeekFrom::Start(start)).await;

        match (copied, restored) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(materialization_error(path, e)),
            (Ok(n), Ok(_)) => Ok(n),
        }
    }

    async fn copy_into<R>(
        &self,
        reader: &mut R,
        path: &Path,
        total: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, MdForgeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let file = create_output(path).await?;
        let mut writer = BufWriter::with_capacity(self.options.buffer_size, file);
        let mut buf = vec![0u8; self.options.buffer_size];
        let mut written = 0u64;

        loop {
            cancel.check(STAGE)?;
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| materialization_error(path, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| materialization_error(path, e))?;
            written += n as u64;
            self.report(written, total);
        }

        writer
            .flush()
            .await
            .map_err(|e| materialization_error(path, e))?;
        Ok(written)
    }

    fn report(&self, written: u64, total: Option<u64>) {
        progress::emit(self.progress.as_ref(), || {
            ProgressEvent::new(STAGE, written, total)
        });
    }
}

async fn create_output(path: &Path) -> Result<File, MdForgeError> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| materialization_error(path, e))
}

fn materialization_error(path: &Path, source: std::io::Error) -> MdForgeError {
    MdForgeError::Materialization {
        path: path.to_path_buf(),
        source,
    }
}

/// `info.filename` (last path component only), else `source<ext>`.
fn output_file_name(info: &StreamInfo, default_extension: &str) -> String {
    let from_info = info
        .filename
        .as_deref()
        .and_then(|f| Path::new(f).file_name())
        .map(|f| f.to_string_lossy().into_owned())
        .filter(|f| !f.trim().is_empty());
    if let Some(name) = from_info {
        return name;
    }
    let ext = info.normalized_extension().unwrap_or_else(|| {
        let trimmed = default_extension.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!(".{trimmed}")
        }
    });
    format!("source{ext}")
}

/// Last non-empty URL path segment, if it looks like a filename.
fn filename_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    (!last.is_empty() && last.contains('.')).then(|| last.to_string())
}
