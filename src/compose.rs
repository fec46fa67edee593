//! Segment composition: assemble ordered segments into the final Markdown.
//!
//! [`compose`] is a pure left-to-right pass over the segment list. It keeps
//! no cache, so calling it after a middleware edited the list always reflects
//! the edit, and calling it twice on an unchanged list yields identical bytes.
//!
//! ## Layout
//!
//! ```text
//! [page:1][label:Intro]        ← annotation line (optional)
//! # Heading                    ← segment markdown, outer blank lines trimmed
//!                              ← exactly one blank line between segments
//! [table:1]
//! | a | b |
//! ```
//!
//! Blank segments are skipped outright: no annotation, no separator.

use crate::config::SegmentOptions;
use crate::segment::{DocumentSegment, SegmentKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Compose `segments` into one Markdown document.
pub fn compose(segments: &[DocumentSegment], options: &SegmentOptions) -> String {
    let mut out = String::new();

    for segment in segments {
        if segment.is_blank() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        if options.include_segment_metadata_in_markdown {
            if let Some(line) = annotation_line(segment) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out.push_str(trim_segment(&segment.markdown));
    }

    out
}

/// Build the bracketed annotation line for one segment, if any tag applies.
pub fn annotation_line(segment: &DocumentSegment) -> Option<String> {
    let mut tags: Vec<String> = Vec::new();
    let mut emitted: Vec<&str> = Vec::new();
    let token = segment.kind.annotation_token();

    if let Some(n) = segment.number {
        tags.push(format!("{token}:{n}"));
        emitted.push(token);
    }

    if segment.kind.is_time_anchored() {
        let timecode = match (segment.start_time, segment.end_time) {
            (Some(start), Some(end)) => Some(format!("{}-{}", format_time(start), format_time(end))),
            (Some(start), None) => Some(format_time(start)),
            _ => None,
        };
        if let Some(tc) = timecode {
            tags.push(format!("timecode:{tc}"));
        }
        emitted.extend(["timecode", "start", "end"]);
    } else {
        if let Some(start) = segment.start_time {
            tags.push(format!("start:{}", format_time(start)));
            emitted.push("start");
        }
        if let Some(end) = segment.end_time {
            tags.push(format!("end:{}", format_time(end)));
            emitted.push("end");
        }
    }

    // Blank values sanitize to nothing; such tags are left out.
    if let Some(label) = segment.label.as_deref() {
        push_tag(&mut tags, "label", &sanitize_tag_value(label));
        emitted.push("label");
    }
    if let Some(source) = segment.source.as_deref() {
        push_tag(&mut tags, "source", &sanitize_tag_value(source));
        emitted.push("source");
    }

    for (key, value) in segment.additional_metadata.iter() {
        if emitted.contains(&key) {
            continue;
        }
        push_tag(&mut tags, &sanitize_tag_value(key), &sanitize_tag_value(value));
    }

    if tags.is_empty() {
        return None;
    }
    Some(tags.iter().map(|t| format!("[{t}]")).collect())
}

fn push_tag(tags: &mut Vec<String>, key: &str, value: &str) {
    if !key.is_empty() && !value.is_empty() {
        tags.push(format!("{key}:{value}"));
    }
}

/// Keep a tag value on one line and free of tag delimiters.
///
/// Whitespace becomes `_`; `[`, `]`, `:` and line breaks become `-`.
pub fn sanitize_tag_value(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '\n' | '\r' => '-',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// `mm:ss` below one hour, `hh:mm:ss` from one hour on.
pub fn format_time(value: Duration) -> String {
    let total = value.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// Drop trailing whitespace and leading blank lines, keep leading indentation.
fn trim_segment(markdown: &str) -> &str {
    let trimmed = markdown.trim_end();
    let mut start = 0;
    for line in trimmed.split_inclusive('\n') {
        if line.trim().is_empty() {
            start += line.len();
        } else {
            break;
        }
    }
    &trimmed[start..]
}

// ── Title derivation ─────────────────────────────────────────────────────

static RE_HTML_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static RE_ATX_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s{0,3}#{1,6}[ \t]+(.+?)[ \t#]*$").unwrap());

/// First ATX heading of the document, ignoring HTML comments.
///
/// Image and Metadata segments never contribute: their markdown carries
/// captions and provider notes rather than document structure.
pub fn derive_title(segments: &[DocumentSegment]) -> Option<String> {
    segments
        .iter()
        .filter(|s| !matches!(s.kind, SegmentKind::Image | SegmentKind::Metadata))
        .find_map(|s| title_from_markdown(&s.markdown))
}

/// First ATX heading in a Markdown string, ignoring HTML comments.
pub fn title_from_markdown(markdown: &str) -> Option<String> {
    let visible = RE_HTML_COMMENT.replace_all(markdown, "");
    visible.lines().find_map(|line| {
        RE_ATX_HEADING
            .captures(line)
            .map(|c| c[1].trim().to_string())
            .filter(|t| !t.is_empty())
    })
}
