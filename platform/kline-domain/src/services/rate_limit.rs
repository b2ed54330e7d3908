use std::time::{Duration, Instant};

/// Token bucket with an injected clock. One token per request; refills continuously.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Takes one token, or returns how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        Err(Duration::try_from_secs_f64(deficit / self.refill_per_sec).unwrap_or(Duration::MAX))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::TokenBucket;
    use std::time::{Duration, Instant};

    #[test]
    fn burst_up_to_capacity_then_reports_deficit() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3, 2.0, start);
        for _ in 0..3 {
            assert!(bucket.try_acquire(start).is_ok());
        }
        let wait = bucket.try_acquire(start).expect_err("empty bucket");
        assert_eq!(wait, Duration::from_millis(500));
    }

    #[test]
    fn refill_is_proportional_and_capped() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 4.0, start);
        bucket.try_acquire(start).unwrap();
        bucket.try_acquire(start).unwrap();

        let later = start + Duration::from_millis(250);
        assert!(bucket.try_acquire(later).is_ok());
        assert!(bucket.try_acquire(later).is_err());

        let much_later = later + Duration::from_secs(60);
        assert!((bucket.available(much_later) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn tiny_refill_rate_saturates_the_wait() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, 1e-300, start);
        bucket.try_acquire(start).unwrap();
        assert_eq!(bucket.try_acquire(start), Err(Duration::MAX));
    }

    #[test]
    fn clock_going_backwards_does_not_mint_tokens() {
        let start = Instant::now() + Duration::from_secs(5);
        let mut bucket = TokenBucket::new(1, 1.0, start);
        bucket.try_acquire(start).unwrap();
        assert!(bucket.try_acquire(start - Duration::from_secs(1)).is_err());
    }
}
