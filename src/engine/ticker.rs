//! Cancellable periodic jobs.
//!
//! A job runs on a fixed interval until the shutdown signal fires. A failed
//! or panicking iteration is logged and the next attempt is pushed out with
//! exponential backoff, capped, so a broken dependency never turns into a
//! hot retry loop and never stops the host process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Shared shutdown flag. Clones observe the same signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask every holder to stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only ends on trigger.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// A named job run every `interval`.
#[derive(Debug, Clone)]
pub struct Periodic {
    name: &'static str,
    interval: Duration,
    max_backoff: Duration,
}

impl Periodic {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            max_backoff: interval.saturating_mul(8),
        }
    }

    /// Upper bound on the delay after repeated failures.
    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.interval);
        self
    }

    /// Delay before the next run after `consecutive_failures` failures in a
    /// row. Zero failures means the normal interval.
    pub fn delay_after(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.interval;
        }
        let factor = 1u32 << consecutive_failures.min(16);
        self.interval.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `job` until `shutdown` fires. The first run happens immediately.
    ///
    /// Each iteration runs as its own tokio task so a panic is contained and
    /// reported like an error.
    pub async fn run<F, Fut>(self, shutdown: Shutdown, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        info!(job = self.name, interval_ms = self.interval.as_millis() as u64, "periodic job started");
        let mut failures: u32 = 0;

        while !shutdown.is_triggered() {
            let outcome = tokio::spawn(job())
                .await
                .unwrap_or_else(|e| Err(Error::Other(format!("iteration panicked: {e}"))));

            match outcome {
                Ok(()) => {
                    if failures > 0 {
                        info!(job = self.name, after_failures = failures, "periodic job recovered");
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let retry_in = self.delay_after(failures);
                    error!(
                        job = self.name,
                        consecutive_failures = failures,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "periodic job failed: {e}"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.delay_after(failures)) => {}
            }
        }

        if failures > 0 {
            warn!(job = self.name, consecutive_failures = failures, "periodic job stopping while failing");
        }
        info!(job = self.name, "periodic job stopped");
    }
}
