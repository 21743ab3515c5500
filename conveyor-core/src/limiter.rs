use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::PipeError;

/// Token bucket gating admission into a pipeline.
///
/// Starts full, so the first `capacity` acquisitions pass immediately.
/// A background task adds one token per `refill_interval`, dropping it
/// when the bucket is already full. Must be created inside a tokio runtime,
/// and `refill_interval` must be non-zero.
pub struct TokenBucket {
    shared: Arc<BucketShared>,
}

struct BucketShared {
    capacity: usize,
    refill_interval: Duration,
    available: Mutex<usize>,
    notify: Notify,
    shutdown: CancellationToken,
    granted: AtomicU64,
    rejected: AtomicU64,
    refills: AtomicU64,
    dropped_refills: AtomicU64,
}

/// Counters since the bucket was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub granted: u64,
    /// `try_acquire` calls that timed out. They never consume a token.
    pub rejected: u64,
    pub refills: u64,
    /// Refill ticks that found the bucket full.
    pub dropped_refills: u64,
}

impl LimiterStats {
    /// Achieved grants per second over `elapsed`.
    pub fn rate(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }
        self.granted as f64 / elapsed.as_secs_f64()
    }
}

impl TokenBucket {
    pub fn new(capacity: usize, refill_interval: Duration) -> Self {
        let shared = Arc::new(BucketShared {
            capacity,
            refill_interval,
            available: Mutex::new(capacity),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            granted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            refills: AtomicU64::new(0),
            dropped_refills: AtomicU64::new(0),
        });

        let shared_clone = Arc::clone(&shared);
        tokio::spawn(async move { Self::refill_loop(shared_clone).await });
        Self { shared }
    }

    async fn refill_loop(shared: Arc<BucketShared>) {
        let period = shared.refill_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    break;
                },
                _ = ticker.tick() => {
                    shared.refill_one();
                },
            }
        }
        log::debug!("token bucket refill task stopped");
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.shared.refill_interval
    }

    pub fn available(&self) -> usize {
        *self.shared.slots()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Wait for a token.
    ///
    /// Returns [`PipeError::Cancelled`] if `cancel` fires or the bucket is
    /// stopped before a token becomes available.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), PipeError> {
        let shared = &self.shared;
        loop {
            // register interest before checking, so a refill between the
            // check and the wait is not missed
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() || shared.shutdown.is_cancelled() {
                return Err(PipeError::Cancelled);
            }
            if shared.take() {
                shared.granted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipeError::Cancelled),
                _ = shared.shutdown.cancelled() => return Err(PipeError::Cancelled),
                _ = &mut notified => {},
            }
        }
    }

    /// Wait at most `timeout` for a token. `false` is a normal rejection.
    pub async fn try_acquire(&self, timeout: Duration) -> bool {
        let never = CancellationToken::new();
        match tokio::time::timeout(timeout, self.acquire(&never)).await {
            Ok(Ok(())) => true,
            _ => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let shared = &self.shared;
        LimiterStats {
            granted: shared.granted.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
            refills: shared.refills.load(Ordering::Relaxed),
            dropped_refills: shared.dropped_refills.load(Ordering::Relaxed),
        }
    }

    /// Stop refilling and fail every pending and future `acquire` with
    /// [`PipeError::Cancelled`]. Idempotent.
    pub fn stop(&self) {
        if !self.shared.shutdown.is_cancelled() {
            log::debug!("token bucket stopping");
        }
        self.shared.shutdown.cancel();
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BucketShared {
    fn slots(&self) -> MutexGuard<'_, usize> {
        // no code path panics while holding the lock
        self.available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self) -> bool {
        let mut available = self.slots();
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    fn refill_one(&self) {
        let added = {
            let mut available = self.slots();
            if *available < self.capacity {
                *available += 1;
                true
            } else {
                false
            }
        };

        if added {
            self.refills.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
        } else {
            self.dropped_refills.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
#[path = "limiter_test.rs"]
mod limiter_test;
