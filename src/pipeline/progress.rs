//! Segment progress reporting.
//!
//! With [`ProgressDetailLevel::Detailed`] one `"segments"` event is emitted per
//! segment, `completed` running 1..=N with per-segment details. With
//! [`ProgressDetailLevel::Basic`] a single summary event carries the count per
//! segment kind. Large documents therefore cost one event unless the caller
//! asks for more.

use crate::cancel::CancellationToken;
use crate::error::MdForgeError;
use crate::pipeline::{ConversionMiddleware, PipelineContext};
use crate::progress::{self, ProgressDetailLevel, ProgressEvent};
use crate::segment::count_by_kind;
use async_trait::async_trait;

/// Stage name used for segment progress events.
pub const SEGMENTS_STAGE: &str = "segments";

/// Segments between cancellation checks in detailed mode.
const CANCEL_CHECK_INTERVAL: usize = 64;

/// Reports segment progress to the context's sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentProgressMiddleware;

#[async_trait]
impl ConversionMiddleware for SegmentProgressMiddleware {
    fn name(&self) -> &str {
        "segment-progress"
    }

    async fn invoke(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), MdForgeError> {
        let Some(sink) = ctx.progress_sink() else {
            return Ok(());
        };
        let total = ctx.segments.len() as u64;

        match ctx.progress_detail() {
            ProgressDetailLevel::Detailed => {
                for (i, segment) in ctx.segments.iter().enumerate() {
                    if i % CANCEL_CHECK_INTERVAL == 0 {
                        cancel.check(self.name())?;
                    }
                    progress::emit(Some(sink), || {
                        ProgressEvent::new(SEGMENTS_STAGE, i as u64 + 1, Some(total))
                            .with_details(segment.describe())
                    });
                }
            }
            ProgressDetailLevel::Basic => {
                cancel.check(self.name())?;
                let summary = count_by_kind(&ctx.segments)
                    .iter()
                    .map(|(kind, n)| format!("{kind}={n}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                progress::emit(Some(sink), || {
                    let event = ProgressEvent::new(SEGMENTS_STAGE, total, Some(total));
                    if summary.is_empty() {
                        event
                    } else {
                        event.with_details(summary)
                    }
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ConversionPipeline;
    use crate::progress::RecordingProgressSink;
    use crate::segment::{DocumentSegment, SegmentKind};
    use crate::source::StreamInfo;
    use std::sync::Arc;

    fn segments() -> Vec<DocumentSegment> {
        vec![
            DocumentSegment::new(SegmentKind::Page, "a").with_number(1).with_label("Intro"),
            DocumentSegment::new(SegmentKind::Table, "b").with_number(1),
            DocumentSegment::new(SegmentKind::Page, "c").with_number(2),
        ]
    }

    async fn run(level: ProgressDetailLevel) -> Vec<ProgressEvent> {
        let sink = Arc::new(RecordingProgressSink::new());
        let mut ctx = PipelineContext::new(StreamInfo::new())
            .with_segments(segments())
            .with_progress(Some(sink.clone()), level);
        ConversionPipeline::new(vec![Arc::new(SegmentProgressMiddleware)])
            .execute(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        sink.stage(SEGMENTS_STAGE)
    }

    #[tokio::test]
    async fn detailed_emits_one_event_per_segment() {
        let events = run(ProgressDetailLevel::Detailed).await;
        assert_eq!(events.len(), 3);
        let completed: Vec<u64> = events.iter().map(|e| e.completed).collect();
        assert_eq!(completed, vec![1, 2, 3]);
        assert!(events.iter().all(|e| e.total == Some(3)));
        assert_eq!(events[0].details.as_deref(), Some("page:1 Intro"));
        assert_eq!(events[1].details.as_deref(), Some("table:1"));
    }

    #[tokio::test]
    async fn basic_emits_single_summary() {
        let events = run(ProgressDetailLevel::Basic).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].completed, 3);
        assert_eq!(events[0].total, Some(3));
        assert_eq!(events[0].details.as_deref(), Some("page=2, table=1"));
    }

    #[tokio::test]
    async fn no_sink_is_a_no_op() {
        let mut ctx = PipelineContext::new(StreamInfo::new()).with_segments(segments());
        SegmentProgressMiddleware
            .invoke(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn detailed_stops_when_cancelled() {
        let sink = Arc::new(RecordingProgressSink::new());
        let mut ctx = PipelineContext::new(StreamInfo::new())
            .with_segments(segments())
            .with_progress(Some(sink.clone()), ProgressDetailLevel::Detailed);
        let token = CancellationToken::new();
        token.cancel();
        let err = SegmentProgressMiddleware
            .invoke(&mut ctx, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(sink.events().is_empty());
    }
}
