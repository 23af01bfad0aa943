//! Bounded-concurrency gates for outbound connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::Error;

/// A counting semaphore sized once, on first use.
///
/// The permit returned by [`acquire`](Self::acquire) releases its slot when
/// dropped, so every exit path (errors, early returns, panics) gives it back.
pub struct RateLimiter {
    size: AtomicUsize,
    semaphore: OnceLock<Arc<Semaphore>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            size: AtomicUsize::new(1),
            semaphore: OnceLock::new(),
        }
    }

    /// Sets the number of slots; `n <= 0` means 1. Ignored after first use.
    pub fn set_limit(&self, n: i64) {
        if self.semaphore.get().is_some() {
            return;
        }
        let n = usize::try_from(n).unwrap_or(0).max(1);
        self.size.store(n, Ordering::SeqCst);
    }

    /// Number of slots the limiter has (or will have).
    pub fn limit(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, Error> {
        let semaphore = self
            .semaphore
            .get_or_init(|| Arc::new(Semaphore::new(self.size.load(Ordering::SeqCst))));
        Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Request("rate limiter closed".into()))
    }

    /// Slots currently free (the full size before first use).
    pub fn available(&self) -> usize {
        self.semaphore
            .get()
            .map(|s| s.available_permits())
            .unwrap_or_else(|| self.size.load(Ordering::SeqCst))
    }
}
