//! Cooperative cancellation shared between a caller and one conversion.
//!
//! The token is cheap to clone; every clone observes the same flag. Stages
//! poll [`CancellationToken::check`] at their suspension points and between
//! bounded batches of work, and async waiters can park on
//! [`CancellationToken::cancelled`].

use crate::error::MdForgeError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A clonable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` tagged with `stage` once cancellation was requested.
    pub fn check(&self, stage: &str) -> Result<(), MdForgeError> {
        if self.is_cancelled() {
            Err(MdForgeError::Cancelled {
                stage: stage.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
