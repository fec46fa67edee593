//! Image artifact persistence.
//!
//! Writes each extracted image into the conversion's workspace as
//! `images/image-<n>.<ext>` and records where it went. The extension comes
//! from the image bytes (`image::guess_format`), falling back to the mime type
//! the converter declared.

use crate::cancel::CancellationToken;
use crate::error::MdForgeError;
use crate::pipeline::{ConversionMiddleware, PipelineContext};
use crate::segment::SegmentKind;
use crate::workspace::ArtifactWorkspace;
use async_trait::async_trait;
use tracing::{debug, info};

/// Persists image artifacts into the workspace.
///
/// Without a workspace in the context this stage does nothing. Images that
/// already carry a `file_path` are left alone. When an image's owning Image
/// segment is still blank it receives a `![label](images/…)` reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactPersistenceMiddleware;

#[async_trait]
impl ConversionMiddleware for ArtifactPersistenceMiddleware {
    fn name(&self) -> &str {
        "artifact-persistence"
    }

    async fn invoke(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), MdForgeError> {
        let Some(mut workspace) = ctx.take_workspace() else {
            debug!("No workspace; skipping image persistence");
            return Ok(());
        };
        let result = persist_images(ctx, &mut workspace, cancel, self.name()).await;
        ctx.set_workspace(workspace);

        let persisted = result?;
        if persisted > 0 {
            info!("Persisted {} image artifact(s)", persisted);
        }
        Ok(())
    }
}

async fn persist_images(
    ctx: &mut PipelineContext,
    workspace: &mut ArtifactWorkspace,
    cancel: &CancellationToken,
    stage: &str,
) -> Result<usize, MdForgeError> {
    let mut persisted = 0usize;

    for (n, image) in ctx.artifacts.images.iter_mut().enumerate() {
        cancel.check(stage)?;
        if image.file_path.is_some() || image.data.is_empty() {
            continue;
        }

        let name = format!("images/image-{}.{}", n + 1, image.file_extension());
        let artifact = workspace.persist_binary(&name, &image.data).await?;
        image.file_path = Some(artifact.local_path.clone());
        if image.mime_type.is_none() {
            image.mime_type = image.detected_mime();
        }

        if let Some(segment) = image
            .segment_index
            .and_then(|i| ctx.segments.get_mut(i))
            .filter(|s| s.kind == SegmentKind::Image && s.is_blank())
        {
            let alt = image.label.as_deref().unwrap_or("image");
            segment.markdown = format!("![{alt}]({name})");
        }
        persisted += 1;
    }

    Ok(persisted)
}
