//! Token-bucket rate limiter shared by the watchers' blocking queries.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DrainError, DrainResult};

/// Longest single sleep before the bucket is checked again.
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Refills at `rate` tokens per second up to `burst`; each query takes one.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for a refill if the bucket is empty.
    pub async fn wait(&self, cancel: &CancellationToken) -> DrainResult<()> {
        loop {
            let delay = match self.try_acquire() {
                None => return Ok(()),
                Some(delay) => delay,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DrainError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Take a token if one is available; otherwise return how long until
    /// one will be.
    fn try_acquire(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            Some(refill_delay(1.0 - bucket.tokens, self.rate))
        }
    }
}

/// Time for `missing` tokens to refill at `rate`, capped at [`MAX_WAIT`].
/// Rates that never refill wait the cap.
fn refill_delay(missing: f64, rate: f64) -> Duration {
    if !(rate.is_finite() && rate > 0.0) {
        return MAX_WAIT;
    }
    Duration::try_from_secs_f64(missing / rate).map_or(MAX_WAIT, |d| d.min(MAX_WAIT))
}
