//! Prompts for provider-backed image descriptions.
//!
//! Kept apart from [`crate::pipeline::caption`] so the wording can change
//! without touching the call or error-handling logic, and so tests can
//! inspect it without a provider.

/// System prompt for describing one extracted image.
pub const CAPTION_SYSTEM_PROMPT: &str = r#"You describe images extracted from documents so the description can stand in for the image in a Markdown file.

Rules:
1. Describe what the image shows in at most three sentences.
2. Transcribe any visible text, labels or numbers that carry meaning.
3. For charts, name the chart type, the axes and the main trend.
4. For diagrams, name the components and how they connect.
5. Output plain prose only: no Markdown headings, no lists, no code fences.
6. Do NOT speculate about content that is not visible."#;

/// User-turn text accompanying the image.
///
/// `label` is the caption or alt text the converter found, if any.
pub fn caption_request(label: Option<&str>) -> String {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => format!(
            "Describe this image. The document labels it as: \"{}\"",
            label
        ),
        None => "Describe this image.".to_string(),
    }
}
