//! Segment model: ordered, typed units of converted content.
//!
//! A conversion yields a `Vec<DocumentSegment>` in source-document order.
//! That order is load-bearing (composition, titles, chunking downstream all
//! read it left to right) and no stage in this crate re-sorts it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The kind of source unit a segment was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    #[default]
    Unknown,
    Page,
    Slide,
    Sheet,
    Table,
    Section,
    Chapter,
    Image,
    Metadata,
    Audio,
}

/// Annotation token and time-anchoring per kind.
///
/// Adding a kind means adding a row here; nothing else branches on the kind
/// to pick a token.
static KIND_TABLE: &[(SegmentKind, &str, bool)] = &[
    (SegmentKind::Page, "page", false),
    (SegmentKind::Slide, "slide", false),
    (SegmentKind::Sheet, "sheet", false),
    (SegmentKind::Table, "table", false),
    (SegmentKind::Section, "section", false),
    (SegmentKind::Chapter, "chapter", false),
    (SegmentKind::Image, "image", false),
    (SegmentKind::Metadata, "metadata", false),
    (SegmentKind::Audio, "audio", true),
];

impl SegmentKind {
    fn row(self) -> Option<&'static (SegmentKind, &'static str, bool)> {
        KIND_TABLE.iter().find(|(kind, _, _)| *kind == self)
    }

    /// Token used in numbered annotation tags (`page`, `table`, …).
    ///
    /// Audio segments are annotated with a timecode, so their numbered tag
    /// uses the generic `segment` token.
    pub fn annotation_token(self) -> &'static str {
        match self.row() {
            Some((_, _, true)) | None => "segment",
            Some((_, token, false)) => *token,
        }
    }

    /// Lower-case display name (`"page"`, `"audio"`, `"unknown"`).
    pub fn name(self) -> &'static str {
        self.row().map(|(_, token, _)| *token).unwrap_or("unknown")
    }

    /// True for kinds whose start/end render as a single timecode tag.
    pub fn is_time_anchored(self) -> bool {
        self.row().map(|(_, _, timed)| *timed).unwrap_or(false)
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered key → value metadata with unique keys.
///
/// Insertion order is preserved; re-inserting a key replaces its value in
/// place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMap(Vec<(String, String)>);

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => Some(std::mem::replace(v, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetadataMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = MetadataMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// One ordered unit of converted content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSegment {
    pub kind: SegmentKind,
    /// 1-based sequence number within its kind.
    pub number: Option<u32>,
    pub label: Option<String>,
    pub source: Option<String>,
    pub start_time: Option<Duration>,
    pub end_time: Option<Duration>,
    pub additional_metadata: MetadataMap,
    pub markdown: String,
}

impl DocumentSegment {
    pub fn new(kind: SegmentKind, markdown: impl Into<String>) -> Self {
        Self {
            kind,
            markdown: markdown.into(),
            ..Self::default()
        }
    }

    pub fn with_number(mut self, number: u32) -> Self {
        self.number = Some(number);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_time_range(mut self, start: Duration, end: Option<Duration>) -> Self {
        self.start_time = Some(start);
        self.end_time = end;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_metadata.insert(key, value);
        self
    }

    /// True when the segment contributes nothing to composed output.
    pub fn is_blank(&self) -> bool {
        self.markdown.trim().is_empty()
    }

    /// Short description for progress details: `"page:3 Intro"`.
    pub fn describe(&self) -> String {
        let mut out = self.kind.name().to_string();
        if let Some(n) = self.number {
            out.push(':');
            out.push_str(&n.to_string());
        }
        if let Some(tail) = self.label.as_deref().or(self.source.as_deref()) {
            out.push(' ');
            out.push_str(tail);
        }
        out
    }
}

/// An image extracted during conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    #[serde(skip)]
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
    pub label: Option<String>,
    pub page_number: Option<u32>,
    /// Index into the segment list of the Image segment showing this artifact.
    pub segment_index: Option<usize>,
    /// Provider-generated description.
    pub description: Option<String>,
    /// Workspace file the image was persisted to.
    pub file_path: Option<PathBuf>,
    pub metadata: MetadataMap,
}

impl ImageArtifact {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_segment_index(mut self, index: usize) -> Self {
        self.segment_index = Some(index);
        self
    }

    /// Mime type sniffed from the bytes, falling back to the declared one.
    pub fn detected_mime(&self) -> Option<String> {
        image::guess_format(&self.data)
            .ok()
            .map(|f| f.to_mime_type().to_string())
            .or_else(|| self.mime_type.clone())
    }

    /// File extension (without dot) matching [`Self::detected_mime`].
    pub fn file_extension(&self) -> &'static str {
        if let Ok(format) = image::guess_format(&self.data) {
            if let Some(ext) = format.extensions_str().first() {
                return *ext;
            }
        }
        match self.mime_type.as_deref() {
            Some("image/png") => "png",
            Some("image/jpeg") | Some("image/jpg") => "jpg",
            Some("image/gif") => "gif",
            Some("image/webp") => "webp",
            Some("image/svg+xml") => "svg",
            _ => "bin",
        }
    }
}

/// Non-textual outputs of a conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionArtifacts {
    pub images: Vec<ImageArtifact>,
    /// Document-level metadata (author, created, …) reported by the converter.
    pub metadata: BTreeMap<String, String>,
}

impl ConversionArtifacts {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.metadata.is_empty()
    }
}

/// Segment counts per kind, in kind order.
pub fn count_by_kind(segments: &[DocumentSegment]) -> BTreeMap<SegmentKind, usize> {
    let mut counts = BTreeMap::new();
    for segment in segments {
        *counts.entry(segment.kind).or_insert(0) += 1;
    }
    counts
}
