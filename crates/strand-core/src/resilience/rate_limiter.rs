//! Token-bucket rate limiter with FIFO waiters.
//!
//! Tokens refill continuously at `refill_rate` per `refill_interval`, capped
//! at `max_tokens`. [`RateLimiter::try_acquire`] is non-blocking;
//! [`RateLimiter::acquire`] parks the caller in a FIFO queue and resolves on
//! refill, cancellation, or timeout. [`RateLimiter::stop`] rejects every
//! waiter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Bucket configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Bucket capacity.
    pub max_tokens: f64,
    /// Tokens added per `refill_interval`.
    pub refill_rate: f64,
    /// Refill period.
    pub refill_interval: Duration,
}

/// Errors from [`RateLimiter::acquire`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("acquire timed out")]
    Timeout,

    #[error("acquire aborted")]
    Aborted,

    #[error("rate limiter stopped")]
    Stopped,
}

/// Options for a blocking acquire.
#[derive(Default)]
pub struct AcquireOptions {
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
}

struct Waiter {
    seq: u64,
    tx: oneshot::Sender<()>,
}

struct Inner {
    tokens: f64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    next_seq: u64,
    stopped: bool,
    refiller_running: bool,
}

/// Token-bucket rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    inner: Arc<Mutex<Inner>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tokens: config.max_tokens,
                last_refill: Instant::now(),
                waiters: VecDeque::new(),
                next_seq: 0,
                stopped: false,
                refiller_running: false,
            })),
            config,
        }
    }

    /// Non-blocking acquire of one token.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        if inner.stopped {
            return false;
        }
        self.refill(&mut inner);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.inner.lock().expect("rate limiter lock").waiters.len()
    }

    /// Tokens currently available (after an on-demand refill).
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        self.refill(&mut inner);
        inner.tokens
    }

    /// Acquire one token, parking FIFO until refill, timeout, or abort.
    pub async fn acquire(&self, options: AcquireOptions) -> Result<(), RateLimitError> {
        let (seq, rx) = {
            let mut inner = self.inner.lock().expect("rate limiter lock");
            if inner.stopped {
                return Err(RateLimitError::Stopped);
            }
            self.refill(&mut inner);
            // Tokens go to the queue head first; jumping it here would
            // starve earlier waiters.
            if inner.tokens >= 1.0 && inner.waiters.is_empty() {
                inner.tokens -= 1.0;
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.waiters.push_back(Waiter { seq, tx });
            self.spawn_refiller_if_needed(&mut inner);
            (seq, rx)
        };

        let timeout = self
            .config
            .refill_interval
            .checked_mul(u32::MAX)
            .unwrap_or(Duration::MAX);
        let timeout = options.timeout.unwrap_or(timeout);
        let signal = options.signal.unwrap_or_default();

        tokio::select! {
            granted = rx => match granted {
                Ok(()) => Ok(()),
                Err(_) => Err(RateLimitError::Stopped),
            },
            _ = tokio::time::sleep(timeout) => {
                self.remove_waiter(seq);
                Err(RateLimitError::Timeout)
            }
            _ = signal.cancelled() => {
                self.remove_waiter(seq);
                Err(RateLimitError::Aborted)
            }
        }
    }

    /// Reject every parked waiter and refuse future acquisitions.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        inner.stopped = true;
        // Dropping the senders resolves each waiter's receiver with an error.
        inner.waiters.clear();
    }

    fn refill(&self, inner: &mut Inner) {
        let elapsed = inner.last_refill.elapsed();
        if elapsed.is_zero() {
            return;
        }
        let intervals = elapsed.as_secs_f64() / self.config.refill_interval.as_secs_f64();
        let added = intervals * self.config.refill_rate;
        if added > 0.0 {
            inner.tokens = (inner.tokens + added).min(self.config.max_tokens);
            inner.last_refill = Instant::now();
        }
    }

    fn remove_waiter(&self, seq: u64) {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        inner.waiters.retain(|w| w.seq != seq);
    }

    /// Lazily run one background task that drains waiters as tokens refill.
    /// The task exits when the queue empties or the limiter stops.
    fn spawn_refiller_if_needed(&self, inner: &mut Inner) {
        if inner.refiller_running {
            return;
        }
        inner.refiller_running = true;

        let limiter = self.clone();
        // Wake often enough to hand out single tokens promptly even with
        // long refill intervals.
        let tick = (limiter.config.refill_interval.as_secs_f64()
            / limiter.config.refill_rate.max(1.0))
        .min(0.05);
        let tick = Duration::from_secs_f64(tick.max(0.001));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let mut inner = limiter.inner.lock().expect("rate limiter lock");
                if inner.stopped {
                    inner.refiller_running = false;
                    return;
                }
                limiter.refill(&mut inner);
                while inner.tokens >= 1.0 {
                    match inner.waiters.pop_front() {
                        Some(waiter) => {
                            inner.tokens -= 1.0;
                            if waiter.tx.send(()).is_err() {
                                // Receiver raced away (timeout/abort): the
                                // token goes back to the bucket.
                                inner.tokens += 1.0;
                            }
                        }
                        None => break,
                    }
                }
                if inner.waiters.is_empty() {
                    inner.refiller_running = false;
                    return;
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: f64, rate: f64, interval_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_tokens: max,
            refill_rate: rate,
            refill_interval: Duration::from_millis(interval_ms),
        })
    }

    #[tokio::test]
    async fn test_try_acquire_drains_bucket() {
        let rl = limiter(2.0, 1.0, 60_000);
        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(!rl.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_resolves_on_refill() {
        let rl = limiter(1.0, 1.0, 50);
        assert!(rl.try_acquire());

        let start = Instant::now();
        rl.acquire(AcquireOptions::default()).await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(20),
            "resolved before refill"
        );
    }

    #[tokio::test]
    async fn test_abort_rejects_and_clears_waiter() {
        // maxTokens=1, refill 1 per 10s: consume the token, park an acquire,
        // abort after 10ms.
        let rl = limiter(1.0, 1.0, 10_000);
        assert!(rl.try_acquire());

        let signal = CancellationToken::new();
        let child = signal.clone();
        let handle = {
            let rl = rl.clone();
            tokio::spawn(async move {
                rl.acquire(AcquireOptions {
                    timeout: None,
                    signal: Some(child),
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result, Err(RateLimitError::Aborted));
        assert_eq!(rl.waiting(), 0);
    }

    #[tokio::test]
    async fn test_timeout_rejects() {
        let rl = limiter(1.0, 1.0, 60_000);
        assert!(rl.try_acquire());
        let result = rl
            .acquire(AcquireOptions {
                timeout: Some(Duration::from_millis(20)),
                signal: None,
            })
            .await;
        assert_eq!(result, Err(RateLimitError::Timeout));
        assert_eq!(rl.waiting(), 0);
    }

    #[tokio::test]
    async fn test_stop_rejects_all_waiters() {
        let rl = limiter(1.0, 1.0, 60_000);
        assert!(rl.try_acquire());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move {
                rl.acquire(AcquireOptions::default()).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rl.waiting(), 3);

        rl.stop();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(RateLimitError::Stopped));
        }
        assert!(!rl.try_acquire(), "stopped limiter must refuse tokens");
    }

    #[tokio::test]
    async fn test_waiters_resolve_fifo() {
        let rl = limiter(1.0, 1.0, 30);
        assert!(rl.try_acquire());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let rl = rl.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                rl.acquire(AcquireOptions::default()).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Deterministic registration order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
