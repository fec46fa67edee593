//! Process-wide diagnostic counters.
//!
//! These are the only state shared between concurrent conversions. All
//! updates are relaxed atomic increments; readers get a point-in-time copy
//! via [`snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static CONVERSIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static CONVERSIONS_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static CONVERSIONS_FAILED: AtomicU64 = AtomicU64::new(0);
static CONVERSIONS_CANCELLED: AtomicU64 = AtomicU64::new(0);
static FILES_MATERIALIZED: AtomicU64 = AtomicU64::new(0);
static BYTES_MATERIALIZED: AtomicU64 = AtomicU64::new(0);
static WORKSPACES_CREATED: AtomicU64 = AtomicU64::new(0);
static WORKSPACES_DISPOSED: AtomicU64 = AtomicU64::new(0);

/// Copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub conversions_started: u64,
    pub conversions_succeeded: u64,
    pub conversions_failed: u64,
    pub conversions_cancelled: u64,
    pub files_materialized: u64,
    pub bytes_materialized: u64,
    pub workspaces_created: u64,
    pub workspaces_disposed: u64,
}

pub fn snapshot() -> DiagnosticsSnapshot {
    DiagnosticsSnapshot {
        conversions_started: CONVERSIONS_STARTED.load(Ordering::Relaxed),
        conversions_succeeded: CONVERSIONS_SUCCEEDED.load(Ordering::Relaxed),
        conversions_failed: CONVERSIONS_FAILED.load(Ordering::Relaxed),
        conversions_cancelled: CONVERSIONS_CANCELLED.load(Ordering::Relaxed),
        files_materialized: FILES_MATERIALIZED.load(Ordering::Relaxed),
        bytes_materialized: BYTES_MATERIALIZED.load(Ordering::Relaxed),
        workspaces_created: WORKSPACES_CREATED.load(Ordering::Relaxed),
        workspaces_disposed: WORKSPACES_DISPOSED.load(Ordering::Relaxed),
    }
}

pub(crate) fn conversion_started() {
    CONVERSIONS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn conversion_finished<T>(result: &Result<T, crate::error::MdForgeError>) {
    let counter = match result {
        Ok(_) => &CONVERSIONS_SUCCEEDED,
        Err(e) if e.is_cancelled() => &CONVERSIONS_CANCELLED,
        Err(_) => &CONVERSIONS_FAILED,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn file_materialized(bytes: u64) {
    FILES_MATERIALIZED.fetch_add(1, Ordering::Relaxed);
    BYTES_MATERIALIZED.fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn workspace_created() {
    WORKSPACES_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn workspace_disposed() {
    WORKSPACES_DISPOSED.fetch_add(1, Ordering::Relaxed);
}
