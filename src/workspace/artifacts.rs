//! Per-conversion artifact workspace.
//!
//! An [`ArtifactWorkspace`] is a directory `<root>/<uuid>` owned by exactly one
//! conversion, optionally mirrored to an [`ArtifactStorage`] backend under
//! `<storage prefix>/<uuid>/`. Artifacts are append-only: a name can be
//! persisted once, and nothing already written is rewritten.
//!
//! Disposal runs two independent cleanups:
//!
//! ```text
//! dispose()
//!  ├─ remote: delete_prefix(storage_directory)  if delete_on_dispose
//!  │          storage.dispose()                 if dispose_storage
//!  └─ local:  remove_dir_all(directory)         unless keep_artifact_directory
//! ```
//!
//! A failure in one never skips the other; both failures are reported
//! together as [`MdForgeError::Cleanup`]. Disposal is idempotent, and dropping
//! a workspace that was never disposed still removes the local directory.

use crate::config::{ArtifactStorageOptions, SegmentOptions};
use crate::diagnostics;
use crate::error::MdForgeError;
use crate::source::StreamInfo;
use crate::workspace::storage::{join_key, SharedStorage, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One file written into the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedArtifact {
    /// Workspace-relative name, `/`-separated.
    pub name: String,
    pub local_path: PathBuf,
    /// Remote key, when the workspace is storage-backed.
    pub remote_key: Option<String>,
    pub len: u64,
}

/// Serializable view of a workspace, returned with every conversion result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSummary {
    pub id: String,
    pub directory: PathBuf,
    pub is_storage_backed: bool,
    pub storage_directory: Option<String>,
    /// True when the local directory was kept after disposal.
    pub retained: bool,
    pub artifacts: Vec<PersistedArtifact>,
}

/// Directory plus optional remote mirror for one conversion's artifacts.
pub struct ArtifactWorkspace {
    id: Uuid,
    directory: PathBuf,
    storage: Option<SharedStorage>,
    storage_directory: String,
    keep_local: bool,
    delete_on_dispose: bool,
    dispose_storage: bool,
    artifacts: Vec<PersistedArtifact>,
    disposed: bool,
}

impl ArtifactWorkspace {
    /// Create `<root>/<uuid>` and, when a storage factory is configured,
    /// connect its storage client.
    pub async fn create(
        root: &Path,
        info: &StreamInfo,
        segment_options: &SegmentOptions,
        storage_options: &ArtifactStorageOptions,
    ) -> Result<Self, MdForgeError> {
        let id = Uuid::new_v4();
        let directory = root.join(id.to_string());
        let storage_directory = join_key(&[&storage_options.storage_prefix, &id.to_string()]);

        // The directory comes first: a connected client is never left
        // without a workspace to dispose it.
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| MdForgeError::WorkspaceIo {
                path: directory.clone(),
                source: e,
            })?;

        let storage = match &storage_options.storage_factory {
            Some(factory) => match factory(info) {
                Ok(storage) => Some(storage),
                Err(e) => {
                    let _ = tokio::fs::remove_dir_all(&directory).await;
                    return Err(MdForgeError::Storage {
                        operation: "connect",
                        key: storage_directory,
                        source: e,
                    });
                }
            },
            None => None,
        };
        diagnostics::workspace_created();

        match &storage {
            Some(s) => info!(
                "Created workspace {} (storage: {} at {})",
                directory.display(),
                s.name(),
                storage_directory
            ),
            None => info!("Created workspace {}", directory.display()),
        }

        Ok(Self {
            id,
            directory,
            storage,
            storage_directory,
            keep_local: segment_options.keep_artifact_directory,
            delete_on_dispose: storage_options.delete_on_dispose,
            dispose_storage: storage_options.dispose_storage,
            artifacts: Vec::new(),
            disposed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_storage_backed(&self) -> bool {
        self.storage.is_some()
    }

    /// Remote prefix holding this workspace's objects, if storage-backed.
    pub fn storage_directory(&self) -> Option<&str> {
        self.storage.as_ref().map(|_| self.storage_directory.as_str())
    }

    pub fn artifacts(&self) -> &[PersistedArtifact] {
        &self.artifacts
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Write `content` as a UTF-8 text artifact.
    pub async fn persist_text(
        &mut self,
        name: &str,
        content: &str,
    ) -> Result<&PersistedArtifact, MdForgeError> {
        self.persist_binary_typed(name, content.as_bytes(), Some(content_type_for(name)))
            .await
    }

    /// Write `data` as a binary artifact.
    pub async fn persist_binary(
        &mut self,
        name: &str,
        data: &[u8],
    ) -> Result<&PersistedArtifact, MdForgeError> {
        self.persist_binary_typed(name, data, None).await
    }

    /// Copy the file at `source` into the workspace under `name`.
    pub async fn persist_file(
        &mut self,
        name: &str,
        source: &Path,
    ) -> Result<&PersistedArtifact, MdForgeError> {
        let (rel, path) = self.prepare(name).await?;
        let len = match copy_new(source, &path).await {
            Ok(len) => len,
            Err(e) => return Err(self.discard(&path, e).await),
        };
        let remote_key = match &self.storage {
            Some(storage) => {
                let key = join_key(&[&self.storage_directory, &rel]);
                if let Err(e) = storage.upload_file(&key, &path, None).await {
                    return Err(self.unmirrored(&path, storage_error("upload", &key, e)).await);
                }
                Some(key)
            }
            None => None,
        };
        Ok(self.record(rel, path, remote_key, len))
    }

    async fn persist_binary_typed(
        &mut self,
        name: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<&PersistedArtifact, MdForgeError> {
        let (rel, path) = self.prepare(name).await?;
        if let Err(e) = write_new(&path, data).await {
            return Err(self.discard(&path, e).await);
        }
        let remote_key = match &self.storage {
            Some(storage) => {
                let key = join_key(&[&self.storage_directory, &rel]);
                if let Err(e) = storage.upload(&key, data, content_type).await {
                    return Err(self.unmirrored(&path, storage_error("upload", &key, e)).await);
                }
                Some(key)
            }
            None => None,
        };
        Ok(self.record(rel, path, remote_key, data.len() as u64))
    }

    /// Validate `name`, reject duplicates and create parent directories.
    async fn prepare(&self, name: &str) -> Result<(String, PathBuf), MdForgeError> {
        if self.disposed {
            return Err(MdForgeError::WorkspaceDisposed {
                workspace: self.id.to_string(),
            });
        }
        let rel = validate_name(name)?;
        if self.artifacts.iter().any(|a| a.name == rel) {
            return Err(MdForgeError::ArtifactExists {
                name: rel,
                workspace: self.id.to_string(),
            });
        }
        let path = self.directory.join(&rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(parent, e))?;
        }
        Ok((rel, path))
    }

    fn record(
        &mut self,
        name: String,
        local_path: PathBuf,
        remote_key: Option<String>,
        len: u64,
    ) -> &PersistedArtifact {
        debug!("Persisted artifact {} ({} bytes)", name, len);
        let index = self.artifacts.len();
        self.artifacts.push(PersistedArtifact {
            name,
            local_path,
            remote_key,
            len,
        });
        &self.artifacts[index]
    }

    /// Remove a partially written file unless it predates this call.
    async fn discard(&self, path: &Path, source: std::io::Error) -> MdForgeError {
        if source.kind() != std::io::ErrorKind::AlreadyExists {
            let _ = tokio::fs::remove_file(path).await;
        }
        self.io_error(path, source)
    }

    /// Remove a local file whose upload failed, so the name stays free and
    /// the local directory matches the remote mirror.
    async fn unmirrored(&self, path: &Path, error: MdForgeError) -> MdForgeError {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove unmirrored artifact {}: {}", path.display(), e);
        }
        error
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> MdForgeError {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            let name = path
                .strip_prefix(&self.directory)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path.display().to_string());
            return MdForgeError::ArtifactExists {
                name,
                workspace: self.id.to_string(),
            };
        }
        MdForgeError::WorkspaceIo {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Release the workspace according to its disposal policy.
    ///
    /// Safe to call more than once; only the first call does any work.
    pub async fn dispose(&mut self) -> Result<(), MdForgeError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        diagnostics::workspace_disposed();

        let mut remote_error: Option<StorageError> = None;
        if let Some(storage) = &self.storage {
            if self.delete_on_dispose {
                match storage.delete_prefix(&self.storage_directory).await {
                    Ok(n) => debug!("Deleted {} remote objects under {}", n, self.storage_directory),
                    Err(e) => {
                        warn!("Remote cleanup of {} failed: {}", self.storage_directory, e);
                        remote_error = Some(e);
                    }
                }
            }
            if self.dispose_storage {
                if let Err(e) = storage.dispose().await {
                    warn!("Disposing storage client {} failed: {}", storage.name(), e);
                    remote_error.get_or_insert(e);
                }
            }
        }

        let mut local_error = None;
        if self.keep_local {
            info!("Keeping workspace directory {}", self.directory.display());
        } else {
            match tokio::fs::remove_dir_all(&self.directory).await {
                Ok(()) => debug!("Removed workspace {}", self.directory.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Local cleanup of {} failed: {}", self.directory.display(), e);
                    local_error = Some(e);
                }
            }
        }

        if local_error.is_none() && remote_error.is_none() {
            return Ok(());
        }
        Err(MdForgeError::Cleanup {
            workspace: self.id.to_string(),
            local: local_error,
            remote: remote_error,
        })
    }

    pub fn summary(&self) -> WorkspaceSummary {
        WorkspaceSummary {
            id: self.id.to_string(),
            directory: self.directory.clone(),
            is_storage_backed: self.is_storage_backed(),
            storage_directory: self.storage_directory().map(str::to_string),
            retained: self.keep_local,
            artifacts: self.artifacts.clone(),
        }
    }
}

impl Drop for ArtifactWorkspace {
    fn drop(&mut self) {
        if self.disposed || self.keep_local {
            return;
        }
        // Remote cleanup needs the runtime; only the local directory is
        // reclaimed here.
        match std::fs::remove_dir_all(&self.directory) {
            Ok(()) => debug!("Removed undisposed workspace {}", self.directory.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove undisposed workspace {}: {}",
                self.directory.display(),
                e
            ),
        }
    }
}

impl std::fmt::Debug for ArtifactWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactWorkspace")
            .field("id", &self.id)
            .field("directory", &self.directory)
            .field("storage_directory", &self.storage_directory())
            .field("artifacts", &self.artifacts.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

async fn write_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await
}

async fn copy_new(source: &Path, target: &Path) -> std::io::Result<u64> {
    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .await?;
    let len = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    Ok(len)
}

fn storage_error(operation: &'static str, key: &str, source: StorageError) -> MdForgeError {
    MdForgeError::Storage {
        operation,
        key: key.to_string(),
        source,
    }
}

/// Normalize `name` to a `/`-separated relative path inside the workspace.
fn validate_name(name: &str) -> Result<String, MdForgeError> {
    let invalid = || MdForgeError::InvalidArtifactName {
        name: name.to_string(),
    };
    if name.trim().is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return Err(invalid());
    }
    let mut parts = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

fn content_type_for(name: &str) -> &'static str {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("md") | Some("markdown") => "text/markdown; charset=utf-8",
        Some("json") => "application/json",
        _ => "text/plain; charset=utf-8",
    }
}
