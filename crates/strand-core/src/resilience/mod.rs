//! Generic resilience wrappers: circuit breaker, token-bucket rate limiter,
//! and a cancellation-aware timeout.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod timeout;

pub use circuit_breaker::{BreakerError, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterConfig};
pub use timeout::{with_timeout, TimeoutElapsed};
