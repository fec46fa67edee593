//! Output types for conversion results.

use crate::segment::{ConversionArtifacts, DocumentSegment, SegmentKind};
use crate::workspace::WorkspaceSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Complete result of converting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Final Markdown: the composed segments, or the converter's own
    /// Markdown when it produced no segments.
    pub markdown: String,
    pub title: Option<String>,
    /// Segments after every middleware stage ran.
    pub segments: Vec<DocumentSegment>,
    pub artifacts: ConversionArtifacts,
    /// State of the workspace at disposal.
    pub workspace: WorkspaceSummary,
    pub stats: ConversionStats,
}

/// Conversion statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStats {
    /// Name of the converter that produced the segments.
    pub converter: String,
    pub segment_count: usize,
    pub segments_by_kind: BTreeMap<SegmentKind, usize>,
    pub image_count: usize,
    /// Size of the materialized source in bytes.
    pub source_bytes: u64,
    /// False when an existing file was used in place.
    pub source_copied: bool,
    pub materialize_duration_ms: u64,
    pub convert_duration_ms: u64,
    pub pipeline_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl ConversionResult {
    /// Number of segments of `kind`.
    pub fn count(&self, kind: SegmentKind) -> usize {
        self.stats.segments_by_kind.get(&kind).copied().unwrap_or(0)
    }
}
