//! Input descriptors: [`StreamInfo`] and [`DocumentStream`].
//!
//! `StreamInfo` is an immutable description of an input, assembled before a
//! conversion starts. The `with_*` setters consume and return a new value;
//! nothing in the crate mutates a `StreamInfo` after it is handed over.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncSeek};

/// Immutable descriptor of an input document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub mime_type: Option<String>,
    /// Extension including the leading dot, e.g. `".md"`.
    pub extension: Option<String>,
    pub charset: Option<String>,
    pub filename: Option<String>,
    pub url: Option<String>,
    /// A pre-existing local file holding the same bytes as the stream.
    pub local_path: Option<PathBuf>,
}

impl StreamInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe a local file: filename, extension, mime and path are filled in.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let filename = path.file_name().map(|f| f.to_string_lossy().into_owned());
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()));
        let info = Self {
            filename,
            extension,
            local_path: Some(path.to_path_buf()),
            ..Self::default()
        };
        let mime = info.guess_mime().map(str::to_string);
        Self {
            mime_type: mime,
            ..info
        }
    }

    pub fn with_mime_type(self, mime: impl Into<String>) -> Self {
        Self {
            mime_type: Some(mime.into()),
            ..self
        }
    }

    pub fn with_extension(self, extension: impl Into<String>) -> Self {
        Self {
            extension: Some(extension.into()),
            ..self
        }
    }

    pub fn with_charset(self, charset: impl Into<String>) -> Self {
        Self {
            charset: Some(charset.into()),
            ..self
        }
    }

    pub fn with_filename(self, filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..self
        }
    }

    pub fn with_url(self, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..self
        }
    }

    pub fn with_local_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: Some(path.into()),
            ..self
        }
    }

    /// Lower-case extension with a leading dot, derived from `extension`
    /// or, failing that, from `filename`.
    pub fn normalized_extension(&self) -> Option<String> {
        let raw = self.extension.clone().or_else(|| {
            self.filename
                .as_deref()
                .and_then(|f| Path::new(f).extension())
                .map(|e| e.to_string_lossy().into_owned())
        })?;
        let trimmed = raw.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            None
        } else {
            Some(format!(".{}", trimmed.to_ascii_lowercase()))
        }
    }

    /// Lower-case mime type without parameters (`text/html; charset=…` → `text/html`).
    pub fn normalized_mime(&self) -> Option<String> {
        self.mime_type.as_deref().and_then(|m| {
            let base = m.split(';').next().unwrap_or("").trim();
            (!base.is_empty()).then(|| base.to_ascii_lowercase())
        })
    }

    /// Mime type from the explicit field, else from the extension table.
    pub fn guess_mime(&self) -> Option<&'static str> {
        let ext = self.normalized_extension()?;
        MIME_BY_EXTENSION
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, m)| *m)
    }
}

const MIME_BY_EXTENSION: &[(&str, &str)] = &[
    (".txt", "text/plain"),
    (".md", "text/markdown"),
    (".markdown", "text/markdown"),
    (".html", "text/html"),
    (".htm", "text/html"),
    (".csv", "text/csv"),
    (".json", "application/json"),
    (".xml", "application/xml"),
    (".pdf", "application/pdf"),
    (".docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    (".pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    (".xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    (".eml", "message/rfc822"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".mp3", "audio/mpeg"),
    (".wav", "audio/wav"),
];

/// Any async reader that can also seek.
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

/// The byte source of a conversion.
pub enum DocumentStream {
    /// A stream backed by a file on disk.
    File { file: tokio::fs::File, path: PathBuf },
    /// A seekable in-memory or custom stream.
    Seekable(Box<dyn SeekableRead>),
    /// A one-shot stream (stdin, sockets, decoders).
    Sequential(Box<dyn AsyncRead + Send + Unpin>),
}

impl DocumentStream {
    /// Open `path` as a file-backed stream.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = tokio::fs::File::open(&path).await?;
        Ok(DocumentStream::File { file, path })
    }

    pub fn seekable(reader: impl SeekableRead + 'static) -> Self {
        DocumentStream::Seekable(Box::new(reader))
    }

    pub fn sequential(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        DocumentStream::Sequential(Box::new(reader))
    }

    /// Path of the backing file, if this stream is file-backed.
    pub fn backing_path(&self) -> Option<&Path> {
        match self {
            DocumentStream::File { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn is_seekable(&self) -> bool {
        !matches!(self, DocumentStream::Sequential(_))
    }
}

impl fmt::Debug for DocumentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentStream::File { path, .. } => {
                f.debug_struct("File").field("path", path).finish()
            }
            DocumentStream::Seekable(_) => f.write_str("Seekable(<dyn SeekableRead>)"),
            DocumentStream::Sequential(_) => f.write_str("Sequential(<dyn AsyncRead>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_path_fills_descriptor() {
        let info = StreamInfo::from_path("/tmp/Report.MD");
        assert_eq!(info.filename.as_deref(), Some("Report.MD"));
        assert_eq!(info.normalized_extension().as_deref(), Some(".md"));
        assert_eq!(info.mime_type.as_deref(), Some("text/markdown"));
        assert_eq!(info.local_path, Some(PathBuf::from("/tmp/Report.MD")));
    }

    #[test]
    fn extension_falls_back_to_filename() {
        let info = StreamInfo::new().with_filename("notes.TXT");
        assert_eq!(info.normalized_extension().as_deref(), Some(".txt"));
        let bare = StreamInfo::new().with_extension("csv");
        assert_eq!(bare.normalized_extension().as_deref(), Some(".csv"));
        assert_eq!(StreamInfo::new().normalized_extension(), None);
    }

    #[test]
    fn mime_parameters_are_dropped() {
        let info = StreamInfo::new().with_mime_type("Text/HTML; charset=utf-8");
        assert_eq!(info.normalized_mime().as_deref(), Some("text/html"));
    }

    #[test]
    fn setters_leave_original_untouched() {
        let base = StreamInfo::new().with_filename("a.txt");
        let derived = base.clone().with_url("https://example.com/a.txt");
        assert_eq!(base.url, None);
        assert_eq!(derived.filename.as_deref(), Some("a.txt"));
    }

    #[test]
    fn sequential_streams_are_not_seekable() {
        let s = DocumentStream::sequential(tokio::io::empty());
        assert!(!s.is_seekable());
        assert!(s.backing_path().is_none());
        let c = DocumentStream::seekable(std::io::Cursor::new(vec![1u8, 2, 3]));
        assert!(c.is_seekable());
    }
}
