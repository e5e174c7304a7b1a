//! Token bucket throttling full-sync rows.
//!
//! One limiter is shared by every concurrent transfer, so `rate` bounds the
//! combined row throughput against sources and destination.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens added per second; non-positive or infinite disables limiting.
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `rate` tokens per second, at most `burst` (minimum 1) held at once.
    /// The bucket starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.rate > 0.0 && self.rate.is_finite()
    }

    fn refill(&self, b: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
        b.last_refill = now;
    }

    /// Take one token without waiting.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        if !self.is_limited() {
            return true;
        }
        let mut b = self.bucket.lock();
        self.refill(&mut b);
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        if !self.is_limited() {
            return;
        }
        loop {
            let wait = {
                let mut b = self.bucket.lock();
                self.refill(&mut b);
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - b.tokens) / self.rate)
            };
            trace!(?wait, "rate limited");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::new(0.0, 1);
        assert!(!limiter.is_limited());
        for _ in 0..10_000 {
            limiter.acquire().await;
        }
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_available_immediately() {
        let limiter = RateLimiter::new(10.0, 5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_is_bounded() {
        let limiter = RateLimiter::new(100.0, 10);
        let start = Instant::now();
        for _ in 0..110 {
            limiter.acquire().await;
        }
        // 10 from the burst, 100 more at 100/s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1250), "{elapsed:?}");
    }
}
