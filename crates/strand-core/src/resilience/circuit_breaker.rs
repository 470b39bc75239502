//! Circuit breaker with CLOSED / OPEN / HALF_OPEN states.
//!
//! CLOSED trips to OPEN after `failure_threshold` consecutive failures. After
//! `reset_timeout` the next [`CircuitBreaker::is_allowed`] read promotes OPEN
//! to HALF_OPEN; `success_threshold` consecutive successes there close the
//! circuit, a single failure re-opens it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Breaker thresholds and timing.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip CLOSED -> OPEN.
    pub failure_threshold: u32,
    /// Time OPEN must hold before a probe is allowed.
    pub reset_timeout: Duration,
    /// Consecutive HALF_OPEN successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Errors from [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("circuit '{0}' is open")]
    Open(String),

    /// The wrapped call failed (and was recorded).
    #[error(transparent)]
    Inner(E),
}

/// Callback invoked on every state transition.
pub type StateChangeFn = Arc<dyn Fn(&str, BreakerState) + Send + Sync>;

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    on_state_change: Option<StateChangeFn>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            on_state_change: None,
        }
    }

    /// Attach a state-change observer.
    pub fn with_observer(mut self, observer: StateChangeFn) -> Self {
        self.on_state_change = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state without side effects.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Whether a call may proceed. Reading this promotes OPEN to HALF_OPEN
    /// once the reset timeout has elapsed.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    drop(inner);
                    self.notify(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    drop(inner);
                    self.notify(BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    drop(inner);
                    self.notify(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                drop(inner);
                self.notify(BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Run a call through the breaker: reject when open, record the outcome
    /// otherwise.
    pub async fn execute<T, E, F>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.is_allowed() {
            return Err(BreakerError::Open(self.name.clone()));
        }
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn notify(&self, state: BreakerState) {
        tracing::debug!(breaker = self.name.as_str(), state = state.as_str(), "breaker state change");
        if let Some(observer) = &self.on_state_change {
            observer(&self.name, state);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
