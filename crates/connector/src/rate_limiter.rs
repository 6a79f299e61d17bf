//! Async token bucket shared by every fetch worker.
//!
//! Tokens refill continuously from elapsed time. Waiters are served strictly
//! in arrival order: the bucket sits behind a fair `tokio::sync::Mutex` and
//! the head waiter keeps the lock while it sleeps for its deficit, so later
//! callers queue behind it instead of overtaking.

use std::num::NonZeroU32;
use std::time::Duration;

use rebound_core::config::RateLimitConfig;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("refill rate must be a positive finite number, got {0}")]
    InvalidRate(f64),
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Token-bucket throttle. `acquire` never fails; it only delays.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    per_sec: f64,
    bucket: Mutex<Bucket>,
}

// Absorbs float drift after sleeping exactly the computed deficit.
const EPSILON: f64 = 1e-9;

impl RateLimiter {
    /// A full bucket of `capacity` tokens refilling at `refill_per_second`.
    pub fn new(capacity: NonZeroU32, refill_per_second: f64) -> Result<Self, RateLimitError> {
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(RateLimitError::InvalidRate(refill_per_second));
        }
        let capacity = f64::from(capacity.get());
        Ok(Self {
            capacity,
            per_sec: refill_per_second,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self::new(burst, config.per_second)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn refill_per_second(&self) -> f64 {
        self.per_sec
    }

    /// Wait until `n` tokens are available, then consume them.
    ///
    /// A request larger than the capacity is taken in capacity-sized
    /// installments, so no instant ever sees more than `capacity` tokens
    /// leave the bucket. Dropping the future while it waits consumes
    /// nothing beyond installments already taken.
    pub async fn acquire(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut remaining = f64::from(n);

        let mut bucket = self.bucket.lock().await;
        while remaining > 0.0 {
            let step = remaining.min(self.capacity);
            loop {
                bucket.refill(Instant::now(), self.capacity, self.per_sec);
                if bucket.tokens + EPSILON >= step {
                    break;
                }
                let deficit = step - bucket.tokens;
                let wait = Duration::from_secs_f64(deficit / self.per_sec);
                debug!(
                    tokens = n,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limiter waiting for tokens"
                );
                tokio::time::sleep(wait).await;
            }
            bucket.tokens = (bucket.tokens - step).max(0.0);
            remaining -= step;
        }
    }

    /// Tokens currently in the bucket. Waits behind any queued `acquire`
    /// calls.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.capacity, self.per_sec);
        bucket.tokens
    }
}
