//! Converter contract and registry.
//!
//! A [`DocumentConverter`] turns a materialized source into raw segments and
//! artifacts. Format-specific converters live outside this crate; the crate
//! ships [`PlainTextConverter`] for plain text and Markdown inputs.
//!
//! Selection walks converters in ascending [`DocumentConverter::priority`]
//! (registration order breaks ties): the cheap [`accepts_input`] check on the
//! descriptor first, then the deeper [`accepts`] check that may read the file.
//!
//! [`accepts_input`]: DocumentConverter::accepts_input
//! [`accepts`]: DocumentConverter::accepts

use crate::cancel::CancellationToken;
use crate::error::MdForgeError;
use crate::segment::{ConversionArtifacts, DocumentSegment, SegmentKind};
use crate::source::StreamInfo;
use crate::workspace::MaterializedSource;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// What a converter extracted, before any middleware runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedDocument {
    /// Whole-document Markdown; used when `segments` is empty.
    pub markdown: String,
    pub title: Option<String>,
    /// Segments in source-document order.
    pub segments: Vec<DocumentSegment>,
    pub artifacts: ConversionArtifacts,
}

/// Format-specific extraction.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Lower values are tried first. Default: 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Cheap check against the input descriptor only.
    fn accepts_input(&self, info: &StreamInfo) -> bool;

    /// Deeper check that may inspect the file. Default: accept.
    async fn accepts(&self, _source: &MaterializedSource, _info: &StreamInfo) -> bool {
        true
    }

    async fn convert(
        &self,
        source: &MaterializedSource,
        info: &StreamInfo,
        cancel: &CancellationToken,
    ) -> Result<ExtractedDocument, MdForgeError>;
}

pub type SharedConverter = Arc<dyn DocumentConverter>;

/// Ordered set of converters.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: Vec<SharedConverter>,
}

impl ConverterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in converters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainTextConverter));
        registry
    }

    pub fn register(&mut self, converter: SharedConverter) -> &mut Self {
        self.converters.push(converter);
        self
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Converters in the order they will be tried.
    pub fn ordered(&self) -> Vec<SharedConverter> {
        let mut ordered = self.converters.clone();
        // Stable: equal priorities keep registration order.
        ordered.sort_by_key(|c| c.priority());
        ordered
    }

    /// First converter accepting `info` and then `source`.
    pub async fn select(
        &self,
        source: &MaterializedSource,
        info: &StreamInfo,
    ) -> Result<SharedConverter, MdForgeError> {
        for converter in self.ordered() {
            if !converter.accepts_input(info) {
                continue;
            }
            if converter.accepts(source, info).await {
                debug!("Selected converter '{}'", converter.name());
                return Ok(converter);
            }
        }
        Err(MdForgeError::NoConverter {
            mime: info
                .normalized_mime()
                .or_else(|| info.guess_mime().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string()),
            extension: info
                .normalized_extension()
                .unwrap_or_else(|| "none".to_string()),
        })
    }
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.converters.iter().map(|c| c.name()).collect();
        f.debug_struct("ConverterRegistry")
            .field("converters", &names)
            .finish()
    }
}

// ── Plain text / Markdown ────────────────────────────────────────────────

const TEXT_MIMES: &[&str] = &["text/plain", "text/markdown", "text/x-markdown"];
const TEXT_EXTENSIONS: &[&str] = &[".txt", ".text", ".md", ".markdown"];

/// Bytes sniffed by [`PlainTextConverter::accepts`].
const SNIFF_LEN: usize = 8192;

/// Plain text and Markdown.
///
/// Splits on top-level `# ` headings (outside fenced code) into numbered
/// Section segments. A document without such headings becomes one Page.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextConverter;

#[async_trait]
impl DocumentConverter for PlainTextConverter {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn accepts_input(&self, info: &StreamInfo) -> bool {
        let mime_ok = info
            .normalized_mime()
            .is_some_and(|m| TEXT_MIMES.contains(&m.as_str()));
        let ext_ok = info
            .normalized_extension()
            .is_some_and(|e| TEXT_EXTENSIONS.contains(&e.as_str()));
        mime_ok || ext_ok
    }

    async fn accepts(&self, source: &MaterializedSource, _info: &StreamInfo) -> bool {
        let Ok(reader) = source.open().await else {
            return false;
        };
        let mut head = Vec::with_capacity(SNIFF_LEN);
        if reader.take(SNIFF_LEN as u64).read_to_end(&mut head).await.is_err() {
            return false;
        }
        looks_like_text(&head)
    }

    async fn convert(
        &self,
        source: &MaterializedSource,
        _info: &StreamInfo,
        cancel: &CancellationToken,
    ) -> Result<ExtractedDocument, MdForgeError> {
        cancel.check(self.name())?;
        let mut bytes = Vec::with_capacity(source.len() as usize);
        source
            .open()
            .await
            .map_err(|e| self.error(e))?
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| self.error(e))?;
        cancel.check(self.name())?;

        let text = String::from_utf8_lossy(&bytes);
        let text = text.strip_prefix('\u{FEFF}').unwrap_or(&text);
        Ok(ExtractedDocument {
            markdown: text.to_string(),
            title: None,
            segments: split_sections(text),
            artifacts: ConversionArtifacts::default(),
        })
    }
}

impl PlainTextConverter {
    fn error(&self, e: std::io::Error) -> MdForgeError {
        MdForgeError::Converter {
            converter: self.name().to_string(),
            message: e.to_string(),
        }
    }
}

/// UTF-8 (allowing a cut-off final character) without NUL bytes.
fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// Split on level-1 ATX headings outside fenced code blocks.
fn split_sections(text: &str) -> Vec<DocumentSegment> {
    let mut bodies: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;
    let mut saw_heading = false;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        let is_h1 = !in_fence && (line.starts_with("# ") || line.trim_end() == "#");
        if is_h1 {
            saw_heading = true;
            if !current.trim().is_empty() {
                bodies.push(std::mem::take(&mut current));
            }
            current.clear();
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        bodies.push(current);
    }

    let kind = if saw_heading {
        SegmentKind::Section
    } else {
        SegmentKind::Page
    };
    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| DocumentSegment::new(kind, body).with_number(i as u32 + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaterializeOptions;
    use crate::source::DocumentStream;
    use crate::workspace::Materializer;
    use std::io::Cursor;

    async fn materialized(root: &std::path::Path, text: &str) -> MaterializedSource {
        let mut stream = DocumentStream::seekable(Cursor::new(text.as_bytes().to_vec()));
        Materializer::new(MaterializeOptions {
            buffer_size: 64,
            workspace_root: root.to_path_buf(),
        })
        .materialize(&mut stream, &StreamInfo::new(), ".md", &CancellationToken::new())
        .await
        .unwrap()
    }

    struct Named {
        name: &'static str,
        priority: i32,
    }

    #[async_trait]
    impl DocumentConverter for Named {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn accepts_input(&self, _info: &StreamInfo) -> bool {
            true
        }
        async fn convert(
            &self,
            _source: &MaterializedSource,
            _info: &StreamInfo,
            _cancel: &CancellationToken,
        ) -> Result<ExtractedDocument, MdForgeError> {
            Ok(ExtractedDocument::default())
        }
    }

    #[test]
    fn ordering_is_by_priority_then_registration() {
        let mut registry = ConverterRegistry::new();
        registry
            .register(Arc::new(Named { name: "b", priority: 5 }))
            .register(Arc::new(Named { name: "a", priority: 1 }))
            .register(Arc::new(Named { name: "c", priority: 5 }));
        let names: Vec<String> = registry
            .ordered()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn no_match_reports_descriptor() {
        let root = tempfile::tempdir().unwrap();
        let source = materialized(root.path(), "hello").await;
        let info = StreamInfo::new().with_extension(".pdf");
        let err = ConverterRegistry::with_defaults()
            .select(&source, &info)
            .await
            .err()
            .unwrap();
        match err {
            MdForgeError::NoConverter { mime, extension } => {
                assert_eq!(mime, "application/pdf");
                assert_eq!(extension, ".pdf");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn binary_content_is_rejected_by_deep_check() {
        let root = tempfile::tempdir().unwrap();
        let mut stream = DocumentStream::seekable(Cursor::new(vec![0u8, 159, 146, 150]));
        let source = Materializer::new(MaterializeOptions {
            buffer_size: 64,
            workspace_root: root.path().to_path_buf(),
        })
        .materialize(&mut stream, &StreamInfo::new(), ".txt", &CancellationToken::new())
        .await
        .unwrap();
        let info = StreamInfo::new().with_extension(".txt");
        assert!(PlainTextConverter.accepts_input(&info));
        assert!(!PlainTextConverter.accepts(&source, &info).await);
    }

    #[tokio::test]
    async fn markdown_splits_into_sections() {
        let root = tempfile::tempdir().unwrap();
        let text = "\u{FEFF}preface\n# One\nbody\n```\n# not a heading\n```\n# Two\nmore\n";
        let source = materialized(root.path(), text).await;
        let doc = PlainTextConverter
            .convert(&source, &StreamInfo::new(), &CancellationToken::new())
            .await
            .unwrap();
        let bodies: Vec<&str> = doc.segments.iter().map(|s| s.markdown.as_str()).collect();
        assert_eq!(
            bodies,
            vec![
                "preface\n",
                "# One\nbody\n```\n# not a heading\n```\n",
                "# Two\nmore\n"
            ]
        );
        assert!(doc.segments.iter().all(|s| s.kind == SegmentKind::Section));
        let numbers: Vec<Option<u32>> = doc.segments.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![Some(1), Some(2), Some(3)]);
        assert!(!doc.markdown.starts_with('\u{FEFF}'));
    }

    #[test]
    fn plain_text_is_one_page() {
        let segments = split_sections("just text\n\n#hashtag\n");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Page);
        assert!(split_sections("  \n").is_empty());
    }

    #[test]
    fn text_sniffing() {
        assert!(looks_like_text("héllo".as_bytes()));
        assert!(looks_like_text(&"é".as_bytes()[..1]));
        assert!(!looks_like_text(b"a\0b"));
        assert!(!looks_like_text(&[0xff, 0xfe, 0x41]));
    }
}
