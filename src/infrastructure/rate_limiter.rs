//! Rate Limiter
//!
//! Global token bucket throttle in front of the admission path.

use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::time::Instant;

/// Mutable bucket state, guarded as one unit.
#[derive(Debug)]
struct BucketState {
    /// Current fill, 0 <= tokens <= burst
    tokens: f64,
    /// Instant of the last refill
    last_refill: Instant,
}

/// Token bucket rate limiter.
///
/// Refills continuously at `rate` tokens per second up to `burst` and admits
/// one caller per whole token. The bucket starts full. The check and the
/// refill happen in one critical section, so concurrent callers never
/// observe a half-updated bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a new bucket. Non-positive `rate` or `burst` fall back to 1.
    pub fn new(rate: f64, burst: u32) -> Self {
        let rate = if rate > 0.0 && rate.is_finite() { rate } else { 1.0 };
        let burst = if burst > 0 { burst as f64 } else { 1.0 };
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create a bucket from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.rate, config.burst)
    }

    /// Check if a request is allowed right now.
    ///
    /// Returns true if admitted, false if rate limited.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Check if a request is allowed at `now`.
    ///
    /// An instant earlier than the last refill adds nothing.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        if now > state.last_refill {
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current fill level, without refilling.
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
