//! Provider-backed image descriptions.
//!
//! For every image artifact without a description, one vision call asks the
//! provider for a short description. The text is stored on the artifact and
//! appended to the owning Image segment as an HTML comment block, which keeps
//! it out of title derivation:
//!
//! ```text
//! ![Revenue](images/image-1.png)
//! <!-- Image description:
//! Bar chart of quarterly revenue, rising from Q1 to Q4.
//! -->
//! ```
//!
//! One call per image, no retry: a provider failure fails the stage and the
//! caller decides whether to try again.

use crate::cancel::CancellationToken;
use crate::error::MdForgeError;
use crate::pipeline::{ConversionMiddleware, PipelineContext};
use crate::prompts::{caption_request, CAPTION_SYSTEM_PROMPT};
use crate::segment::{ImageArtifact, SegmentKind};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Produces a description for one image.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    fn name(&self) -> &str;

    async fn describe(&self, image: &ImageArtifact) -> Result<String, MdForgeError>;
}

/// [`ImageDescriber`] backed by an `edgequake_llm` vision provider.
pub struct LlmImageDescriber {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmImageDescriber {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            temperature: 0.1,
            max_tokens: 512,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl ImageDescriber for LlmImageDescriber {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn describe(&self, image: &ImageArtifact) -> Result<String, MdForgeError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(CAPTION_SYSTEM_PROMPT),
            ChatMessage::user_with_images(
                &caption_request(image.label.as_deref()),
                vec![encode_image(image)],
            ),
        ];
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| MdForgeError::Provider {
                provider: self.provider.name().to_string(),
                message: e.to_string(),
            })?;

        debug!(
            "Described image in {:?} ({} input / {} output tokens)",
            start.elapsed(),
            response.prompt_tokens,
            response.completion_tokens
        );
        Ok(response.content)
    }
}

/// Wrap the raw image bytes as a base64 `ImageData` attachment.
///
/// Bytes are sent as-is; `low` detail is enough for a short description.
fn encode_image(image: &ImageArtifact) -> ImageData {
    let mime = image
        .detected_mime()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    ImageData::new(STANDARD.encode(&image.data), mime.as_str()).with_detail("low")
}

/// Fills in missing image descriptions.
///
/// Uses the describer it was built with, else the context's provider. With
/// neither, the stage is a no-op.
#[derive(Default)]
pub struct ImageCaptionMiddleware {
    describer: Option<Arc<dyn ImageDescriber>>,
}

impl ImageCaptionMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_describer(describer: Arc<dyn ImageDescriber>) -> Self {
        Self {
            describer: Some(describer),
        }
    }
}

#[async_trait]
impl ConversionMiddleware for ImageCaptionMiddleware {
    fn name(&self) -> &str {
        "image-caption"
    }

    async fn invoke(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), MdForgeError> {
        let describer: Arc<dyn ImageDescriber> = match (&self.describer, ctx.provider()) {
            (Some(d), _) => Arc::clone(d),
            (None, Some(p)) => Arc::new(LlmImageDescriber::new(Arc::clone(p))),
            (None, None) => {
                debug!("No provider; skipping image captions");
                return Ok(());
            }
        };

        let mut described = 0usize;
        for image in ctx.artifacts.images.iter_mut() {
            if image.description.is_some() || image.data.is_empty() {
                continue;
            }
            cancel.check(self.name())?;

            let text = describer.describe(image).await?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            image.description = Some(text.to_string());

            if let Some(segment) = image
                .segment_index
                .and_then(|i| ctx.segments.get_mut(i))
                .filter(|s| s.kind == SegmentKind::Image)
            {
                segment.markdown = with_description(&segment.markdown, text);
            }
            described += 1;
        }

        if described > 0 {
            info!("Described {} image(s) via {}", described, describer.name());
        }
        Ok(())
    }
}

/// Append a description comment block to `markdown`.
fn with_description(markdown: &str, description: &str) -> String {
    // `-->` inside the text would close the comment early.
    let safe = description.replace("-->", "-- >");
    let body = markdown.trim_end();
    if body.is_empty() {
        format!("<!-- Image description:\n{safe}\n-->")
    } else {
        format!("{body}\n<!-- Image description:\n{safe}\n-->")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::derive_title;
    use crate::pipeline::ConversionPipeline;
    use crate::segment::DocumentSegment;
    use crate::source::StreamInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDescriber {
        text: String,
        calls: AtomicUsize,
    }

    impl FixedDescriber {
        fn new(text: &str) -> Arc<Self> {
            Arc::new(Self {
                text: text.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageDescriber for FixedDescriber {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn describe(&self, _image: &ImageArtifact) -> Result<String, MdForgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.text == "FAIL" {
                return Err(MdForgeError::Provider {
                    provider: "fixed".into(),
                    message: "rate limited".into(),
                });
            }
            Ok(self.text.clone())
        }
    }

    fn context() -> PipelineContext {
        let mut ctx = PipelineContext::new(StreamInfo::new()).with_segments(vec![
            DocumentSegment::new(SegmentKind::Image, "![chart](images/image-1.png)"),
            DocumentSegment::new(SegmentKind::Page, "Body"),
        ]);
        ctx.artifacts.images = vec![
            ImageArtifact::new(vec![1, 2, 3]).with_segment_index(0),
            ImageArtifact {
                description: Some("already done".into()),
                ..ImageArtifact::new(vec![4])
            },
        ];
        ctx
    }

    #[tokio::test]
    async fn describes_missing_images_only() {
        let describer = FixedDescriber::new("# A chart --> rising");
        let mut ctx = context();
        ConversionPipeline::new(vec![Arc::new(ImageCaptionMiddleware::with_describer(
            describer.clone(),
        ))])
        .execute(&mut ctx, &CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(describer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            ctx.artifacts.images[0].description.as_deref(),
            Some("# A chart --> rising")
        );
        assert_eq!(
            ctx.segments[0].markdown,
            "![chart](images/image-1.png)\n<!-- Image description:\n# A chart -- > rising\n-->"
        );
        assert_eq!(derive_title(&ctx.segments), None);
    }

    #[tokio::test]
    async fn no_provider_is_a_no_op() {
        let mut ctx = context();
        ImageCaptionMiddleware::new()
            .invoke(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(ctx.artifacts.images[0].description.is_none());
    }

    #[tokio::test]
    async fn provider_failure_fails_the_stage() {
        let mut ctx = context();
        let err = ConversionPipeline::new(vec![Arc::new(ImageCaptionMiddleware::with_describer(
            FixedDescriber::new("FAIL"),
        ))])
        .execute(&mut ctx, &CancellationToken::new())
        .await
        .unwrap_err();
        assert_eq!(err.failed_stage(), Some("image-caption"));
        assert!(matches!(err.root(), MdForgeError::Provider { .. }));
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_each_call() {
        let describer = FixedDescriber::new("never");
        let mut ctx = context();
        let token = CancellationToken::new();
        token.cancel();
        let err = ImageCaptionMiddleware::with_describer(describer.clone())
            .invoke(&mut ctx, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(describer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn encoded_attachment_is_base64() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let data = encode_image(&ImageArtifact::new(png.to_vec()));
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&data.data).unwrap(), png);
    }
}
