//! Markdown cleanup: deterministic per-segment normalisation.
//!
//! Converters are written independently and their output drifts in small
//! ways: Windows line endings, trailing spaces, runs of blank lines, stray
//! zero-width characters, tables missing their separator row. The rules here
//! fix that without touching content. Each rule is a pure `&str -> String`
//! pass and is tested on its own.
//!
//! ## Rule Order
//!
//! Line endings are normalised before trimming, trimming runs before blank
//! line collapsing, and table repair runs before the spurious-separator pass
//! so the separator it inserts is the one kept.

use crate::cancel::CancellationToken;
use crate::error::MdForgeError;
use crate::pipeline::{ConversionMiddleware, PipelineContext};
use crate::segment::SegmentKind;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Segments between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 32;

/// Applies [`clean_markdown`] to every segment, in place.
///
/// Segment order and count are untouched; a segment that cleans down to
/// nothing stays in the list and is skipped at composition time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownCleanupMiddleware;

#[async_trait]
impl ConversionMiddleware for MarkdownCleanupMiddleware {
    fn name(&self) -> &str {
        "markdown-cleanup"
    }

    async fn invoke(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), MdForgeError> {
        let mut changed = 0usize;
        for (i, segment) in ctx.segments.iter_mut().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check(self.name())?;
            }
            let cleaned = if segment.kind == SegmentKind::Image {
                // Image markdown carries captions and comment blocks; only
                // whitespace-level rules apply.
                clean_whitespace(&segment.markdown)
            } else {
                clean_markdown(&segment.markdown)
            };
            if cleaned != segment.markdown {
                segment.markdown = cleaned;
                changed += 1;
            }
        }
        if ctx.segments.is_empty() && !ctx.markdown.is_empty() {
            cancel.check(self.name())?;
            ctx.markdown = clean_markdown(&ctx.markdown);
        }
        debug!("Cleaned {} of {} segments", changed, ctx.segments.len());
        Ok(())
    }
}

/// Apply every cleanup rule, in order.
///
/// 1. Normalise line endings (CRLF → LF)
/// 2. Trim trailing whitespace per line
/// 3. Collapse 3+ consecutive blank lines down to 2
/// 4. Fix GFM tables missing a separator row
/// 5. Remove spurious mid-table separator rows
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 7. Trim outer blank lines
pub fn clean_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = fix_broken_tables(&s);
    let s = remove_mid_table_separators(&s);
    let s = remove_invisible_chars(&s);
    trim_outer_blank_lines(&s)
}

/// Rules 1, 2, 3, 6 and 7 only: no structural edits.
pub fn clean_whitespace(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    trim_outer_blank_lines(&s)
}

// ── Line endings ─────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Trailing whitespace ──────────────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Blank-line runs ──────────────────────────────────────────────────────────

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

/// At most two consecutive blank lines survive.
fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n\n").into_owned()
}

// ── Outer blank lines ────────────────────────────────────────────────────────

/// Drop leading blank lines and all trailing whitespace, keep indentation.
fn trim_outer_blank_lines(input: &str) -> String {
    let body = input.trim_end();
    let skip: usize = body
        .split_inclusive('\n')
        .take_while(|line| line.trim().is_empty())
        .map(str::len)
        .sum();
    body[skip..].to_string()
}

// ── GFM tables ───────────────────────────────────────────────────────────────

/// Insert a `| --- |` separator after a header row that lacks one.
fn fix_broken_tables(input: &str) -> String {
    let lines: Vec<&str> = input.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);

    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());
        let starts_table = is_table_row(line)
            && !is_separator_row(line)
            && (i == 0 || !is_table_row(lines[i - 1]));
        if !starts_table {
            continue;
        }
        let next = lines.get(i + 1).copied().unwrap_or("");
        if is_table_row(next) && !is_separator_row(next) {
            let columns = line.trim().matches('|').count().saturating_sub(1).max(1);
            out.push(format!("|{}", " --- |".repeat(columns)));
        }
    }

    out.join("\n")
}

/// Keep only the separator directly below the header row.
fn remove_mid_table_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut row_in_table = 0usize;

    for line in input.split('\n') {
        if is_table_row(line) {
            row_in_table += 1;
            if is_separator_row(line) && row_in_table != 2 {
                continue;
            }
        } else {
            row_in_table = 0;
        }
        out.push(line);
    }

    out.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

// ── Invisible characters ─────────────────────────────────────────────────────

const INVISIBLE: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

fn remove_invisible_chars(input: &str) -> String {
    input.replace(INVISIBLE, "")
}
