// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Token-bucket throttling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{AcquireError, ConfigError};

/// Configuration for [`Throttler`].
pub struct ThrottlerConfig {
    interval: Duration,
    burst: usize,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl ThrottlerConfig {
    /// One token is deposited every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            burst: 1,
            on_stop: None,
        }
    }

    /// Maximum number of tokens the bucket may hold. Values below 1 clamp to 1.
    pub fn with_burst(mut self, burst: usize) -> Self {
        self.burst = burst.max(1);
        self
    }

    /// Callback invoked exactly once on the first `stop()`, before the stop
    /// signal becomes observable to waiters.
    pub fn with_on_stop(mut self, on_stop: impl FnOnce() + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(on_stop));
        self
    }
}

/// Token-bucket regulator.
///
/// The bucket starts full at `burst` tokens. A background task deposits one
/// token per `interval`, dropping the deposit when the bucket is already
/// full. The task exits when the construction token is cancelled or the
/// throttler is stopped.
pub struct Throttler {
    inner: Arc<ThrottlerInner>,
}

impl Clone for Throttler {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ThrottlerInner {
    interval: Duration,
    burst: usize,
    tokens: Semaphore,
    stop: CancellationToken,
    stopped: AtomicBool,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Throttler {
    /// Builds the throttler and spawns its refill task. Must be called from
    /// within a Tokio runtime.
    pub fn new(cancel: CancellationToken, config: ThrottlerConfig) -> Result<Self, ConfigError> {
        if config.interval == Duration::ZERO {
            return Err(ConfigError::NonPositiveInterval);
        }
        let inner = Arc::new(ThrottlerInner {
            interval: config.interval,
            burst: config.burst,
            tokens: Semaphore::new(config.burst),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            on_stop: Mutex::new(config.on_stop),
        });
        tokio::spawn(ThrottlerInner::refill(Arc::clone(&inner), cancel));
        Ok(Self { inner })
    }

    /// Consumes one token if available. Never blocks; returns `false` once
    /// the throttler has been stopped.
    pub fn try_acquire(&self) -> bool {
        if self.inner.stop.is_cancelled() {
            return false;
        }
        match self.inner.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Waits for a token. Resolves with `Canceled` when the caller's token
    /// fires first, `Stopped` once the throttler stops. Waiter wake order is
    /// unspecified.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AcquireError::Canceled),
            _ = self.inner.stop.cancelled() => Err(AcquireError::Stopped),
            permit = self.inner.tokens.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(AcquireError::Stopped),
            },
        }
    }

    /// Stops the throttler. Idempotent; the first call runs `on_stop` before
    /// publishing the stop signal, so pending `acquire` calls fail only after
    /// the callback has returned.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(on_stop) = self.inner.on_stop.lock().take() {
            on_stop();
        }
        self.inner.stop.cancel();
    }
}

impl ThrottlerInner {
    async fn refill(inner: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + inner.interval, inner.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.stop.cancelled() => break,
                _ = ticker.tick() => {
                    if inner.tokens.available_permits() < inner.burst {
                        inner.tokens.add_permits(1);
                    }
                }
            }
        }
        debug!("throttler refill task exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{pause, sleep};

    #[tokio::test]
    async fn rejects_zero_interval() {
        let err = Throttler::new(
            CancellationToken::new(),
            ThrottlerConfig::new(Duration::ZERO),
        )
        .err()
        .unwrap();
        assert_eq!(err, ConfigError::NonPositiveInterval);
    }

    #[tokio::test]
    async fn burst_clamps_to_one() {
        pause();
        let thr = Throttler::new(
            CancellationToken::new(),
            ThrottlerConfig::new(Duration::from_millis(20)).with_burst(0),
        )
        .unwrap();
        assert!(thr.try_acquire());
        assert!(!thr.try_acquire());
    }

    #[tokio::test]
    async fn burst_allows_immediate_hits_then_refills() {
        pause();
        let thr = Throttler::new(
            CancellationToken::new(),
            ThrottlerConfig::new(Duration::from_millis(20)).with_burst(2),
        )
        .unwrap();

        assert!(thr.try_acquire());
        assert!(thr.try_acquire());
        assert!(!thr.try_acquire());

        // Blocks until the refill tick ~20ms out.
        let caller = CancellationToken::new();
        thr.acquire(&caller).await.unwrap();
    }

    #[tokio::test]
    async fn refill_does_not_overflow_burst() {
        pause();
        let thr = Throttler::new(
            CancellationToken::new(),
            ThrottlerConfig::new(Duration::from_millis(10)).with_burst(2),
        )
        .unwrap();

        // Bucket is already full; five intervals of idle refill must not
        // accumulate beyond burst.
        sleep(Duration::from_millis(55)).await;
        assert!(thr.try_acquire());
        assert!(thr.try_acquire());
        assert!(!thr.try_acquire());
    }

    #[tokio::test]
    async fn stop_runs_on_stop_exactly_once_and_fails_waiters() {
        pause();
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        let thr = Throttler::new(
            CancellationToken::new(),
            ThrottlerConfig::new(Duration::from_millis(20))
                .with_burst(1)
                .with_on_stop(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();

        assert!(thr.try_acquire());
        thr.stop();
        thr.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        assert!(!thr.try_acquire());
        let caller = CancellationToken::new();
        assert_eq!(thr.acquire(&caller).await, Err(AcquireError::Stopped));
    }

    #[tokio::test]
    async fn acquire_honors_caller_cancellation() {
        pause();
        let thr = Throttler::new(
            CancellationToken::new(),
            ThrottlerConfig::new(Duration::from_secs(60)).with_burst(1),
        )
        .unwrap();
        assert!(thr.try_acquire());

        let caller = CancellationToken::new();
        caller.cancel();
        assert_eq!(thr.acquire(&caller).await, Err(AcquireError::Canceled));
    }

    #[tokio::test]
    async fn pending_acquire_observes_stop() {
        pause();
        let thr = Throttler::new(
            CancellationToken::new(),
            ThrottlerConfig::new(Duration::from_secs(60)).with_burst(1),
        )
        .unwrap();
        assert!(thr.try_acquire());

        let waiter = thr.clone();
        let handle = tokio::spawn(async move {
            let caller = CancellationToken::new();
            waiter.acquire(&caller).await
        });
        // Let the waiter park on the empty bucket before stopping.
        tokio::task::yield_now().await;
        thr.stop();
        assert_eq!(handle.await.unwrap(), Err(AcquireError::Stopped));
    }
}
