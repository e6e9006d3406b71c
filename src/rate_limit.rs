//! Global token bucket shared by every feed loop, so the combined fetch rate
//! against the upstream site stays bounded no matter how many boards are live.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_rate: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or return how long until one is available.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }
}

pub struct FetchRateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl FetchRateLimiter {
    pub fn per_minute(rate: u32) -> Self {
        Self { bucket: Mutex::new(TokenBucket::new(rate)) }
    }

    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.bucket.lock().try_acquire(Instant::now())
    }

    /// Wait until a fetch token is available.
    pub async fn acquire(&self, feed: &str) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    debug!(feed, wait_ms = wait.as_millis() as u64, "fetch rate limited");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_drains_then_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2);
        bucket.last_refill = start;
        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_ok());

        let wait = bucket.try_acquire(start).unwrap_err();
        assert!(wait < Duration::from_secs(31), "wait={wait:?}");

        assert!(bucket.try_acquire(start + Duration::from_secs(31)).is_ok());
    }

    #[tokio::test]
    async fn acquire_returns_immediately_when_tokens_remain() {
        let limiter = FetchRateLimiter::per_minute(60);
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire("tt"))
            .await
            .expect("token should be available");
    }
}
