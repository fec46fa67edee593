//! Storage backend contract for mirrored workspace artifacts.
//!
//! Keys are `/`-separated relative paths. A workspace uploads everything
//! under its own prefix (`<storage prefix>/<workspace id>/…`) and removes the
//! whole prefix on dispose when configured to.
//!
//! Two backends ship with the crate:
//! - [`FileSystemStorage`]: mirrors objects under a root directory.
//! - [`MemoryStorage`]: keeps objects in a map; used by tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Errors reported by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key is empty, absolute or escapes the storage root.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
    /// The client was disposed and can no longer be used.
    #[error("storage client has been disposed")]
    Disposed,
    /// Backend I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Upload-by-key and delete-by-prefix object storage.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Store `data` under `key`, replacing any existing object.
    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Store the file at `path` under `key`.
    ///
    /// The default reads the file into memory; backends that can stream
    /// should override it.
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let data = tokio::fs::read(path).await?;
        self.upload(key, &data, content_type).await
    }

    /// Delete every object whose key lives under `prefix`; returns the count.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Release client resources. Default: nothing to release.
    async fn dispose(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Convenience alias for shared storage clients.
pub type SharedStorage = Arc<dyn ArtifactStorage>;

/// Join key parts with `/`, dropping empty parts and stray slashes.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// True when `key` is `prefix` itself or lives under `prefix/`.
fn under_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    prefix.is_empty() || key == prefix || key.starts_with(&format!("{prefix}/"))
}

fn validate_key(key: &str) -> Result<PathBuf, StorageError> {
    let rel = PathBuf::from(key.trim_matches('/'));
    let valid = !rel.as_os_str().is_empty()
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(rel)
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

/// Objects kept in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    disposed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Copy of an object's bytes.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_live(&self) -> Result<(), StorageError> {
        if self.is_disposed() {
            Err(StorageError::Disposed)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StorageError> {
        self.objects
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".into()))
    }
}

#[async_trait]
impl ArtifactStorage for MemoryStorage {
    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        self.ensure_live()?;
        validate_key(key)?;
        self.lock()?
            .insert(key.trim_matches('/').to_string(), data.to_vec());
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        self.ensure_live()?;
        let mut objects = self.lock()?;
        let before = objects.len();
        objects.retain(|k, _| !under_prefix(k, prefix));
        Ok(before - objects.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_live()?;
        Ok(self
            .lock()?
            .keys()
            .filter(|k| under_prefix(k, prefix))
            .cloned()
            .collect())
    }

    async fn dispose(&self) -> Result<(), StorageError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ── Filesystem backend ───────────────────────────────────────────────────

/// Objects stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_key(key)?))
    }
}

/// Relative `/`-joined paths of every file under `dir`.
fn walk_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(key.join("/"));
        }
    }
    Ok(())
}

#[async_trait]
impl ArtifactStorage for FileSystemStorage {
    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        debug!("Stored {} bytes at {}", data.len(), path.display());
        Ok(())
    }

    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        _content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &target).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let dir = self.object_path(prefix)?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, StorageError> {
            let mut files = Vec::new();
            if dir.is_file() {
                std::fs::remove_file(&dir)?;
                return Ok(1);
            }
            walk_files(&root, &dir, &mut files)?;
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => Ok(files.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
                Err(e) => Err(StorageError::Io(e)),
            }
        })
        .await
        .map_err(|e| StorageError::Backend(format!("delete task panicked: {e}")))?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let start = if prefix.trim_matches('/').is_empty() {
            root.clone()
        } else {
            self.object_path(prefix)?
        };
        let mut keys = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let mut keys = Vec::new();
            walk_files(&root, &start, &mut keys)?;
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("list task panicked: {e}")))??;
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}
