use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RagError;

/// A lightweight cancellation + deadline token. No `tokio_util`-style
/// `CancellationToken`/deadline crate appears anywhere in the reference
/// corpus, so this is hand-rolled: an `Instant` expiry plus a shared
/// `AtomicBool` flag, cheaply cloneable and checkable from any task.
#[derive(Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// A deadline that never expires on its own (still cancellable).
    pub fn never() -> Self {
        Self {
            expires_at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + duration),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Returns an error if this deadline has fired, otherwise `Ok(())`.
    pub fn check(&self) -> Result<(), RagError> {
        if self.is_cancelled() {
            Err(RagError::cancelled("operation was cancelled"))
        } else if self.is_expired() {
            Err(RagError::cancelled("deadline exceeded"))
        } else {
            Ok(())
        }
    }

    /// Race a future against this deadline; map a timeout/cancellation to `RagError::Cancelled`.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, RagError>
    where
        F: std::future::Future<Output = T>,
    {
        self.check()?;
        match self.expires_at {
            Some(at) => tokio::select! {
                result = fut => Ok(result),
                _ = tokio::time::sleep_until(at) => Err(RagError::cancelled("deadline exceeded")),
            },
            None => Ok(fut.await),
        }
    }
}
