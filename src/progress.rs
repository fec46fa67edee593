//! Progress-sink trait for conversion events.
//!
//! Inject an [`Arc<dyn ProgressSink>`] via
//! [`crate::config::ConversionConfigBuilder::progress_sink`] to receive
//! `(stage, completed, total, details)` events while a conversion runs.
//! The materializer reports bytes copied under the `"materialize"` stage and
//! [`crate::pipeline::progress::SegmentProgressMiddleware`] reports segments
//! under the `"segments"` stage.
//!
//! Not configuring a sink is legal; every emit site is a no-op then.
//!
//! # Example
//!
//! ```rust
//! use mdforge::{ConversionConfig, ProgressEvent, ProgressSink};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingSink {
//!     events: AtomicUsize,
//! }
//!
//! impl ProgressSink for CountingSink {
//!     fn report(&self, event: &ProgressEvent) {
//!         self.events.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}: {}/{:?}", event.stage, event.completed, event.total);
//!     }
//! }
//!
//! let sink = Arc::new(CountingSink { events: AtomicUsize::new(0) });
//! let config = ConversionConfig::builder()
//!     .progress_sink(sink as Arc<dyn ProgressSink>)
//!     .build()
//!     .unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// How much detail progress reporting should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProgressDetailLevel {
    /// One terminal summary event per stage. (default)
    #[default]
    Basic,
    /// One event per unit of work with per-unit details.
    Detailed,
}

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage name, e.g. `"materialize"` or `"segments"`.
    pub stage: String,
    /// Units completed so far (bytes, segments, …).
    pub completed: u64,
    /// Total units when known.
    pub total: Option<u64>,
    /// Optional human-readable detail.
    pub details: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: impl Into<String>, completed: u64, total: Option<u64>) -> Self {
        Self {
            stage: stage.into(),
            completed,
            total,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Receives progress events from the materializer and the pipeline.
///
/// Implementations must be `Send + Sync`: independent conversions may share a
/// sink and report from different tasks.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// A no-op sink for callers that don't need progress events.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn report(&self, _event: &ProgressEvent) {}
}

/// A sink that records every event. Handy for tests and post-run reports.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in emission order.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Recorded events for one stage.
    pub fn stage(&self, stage: &str) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage)
            .collect()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type SharedProgressSink = Arc<dyn ProgressSink>;

/// Emit `event` if a sink is present.
///
/// The event is built lazily so callers with no sink pay nothing.
pub(crate) fn emit(sink: Option<&SharedProgressSink>, event: impl FnOnce() -> ProgressEvent) {
    if let Some(sink) = sink {
        sink.report(&event());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_does_not_panic() {
        let sink = NoopProgressSink;
        sink.report(&ProgressEvent::new("segments", 1, Some(3)));
    }

    #[test]
    fn recording_sink_filters_by_stage() {
        let sink = RecordingProgressSink::new();
        sink.report(&ProgressEvent::new("materialize", 256, None));
        sink.report(&ProgressEvent::new("segments", 1, Some(2)).with_details("page:1"));
        sink.report(&ProgressEvent::new("segments", 2, Some(2)));

        assert_eq!(sink.events().len(), 3);
        let segments = sink.stage("segments");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].details.as_deref(), Some("page:1"));
    }

    #[test]
    fn emit_without_sink_never_builds_event() {
        emit(None, || panic!("event must not be built without a sink"));
    }

    #[test]
    fn emit_with_sink_reports() {
        let sink: SharedProgressSink = Arc::new(RecordingProgressSink::new());
        emit(Some(&sink), || ProgressEvent::new("segments", 1, Some(1)));
    }
}
