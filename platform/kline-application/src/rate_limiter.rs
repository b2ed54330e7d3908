use kline_domain::services::rate_limit::TokenBucket;
use kline_domain::value_objects::exchange::Exchange;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Per-exchange request budget shared by that exchange's workers.
#[derive(Debug)]
pub struct RateLimiter {
    exchange: Exchange,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(exchange: Exchange, capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            exchange,
            bucket: Mutex::new(TokenBucket::new(
                capacity,
                refill_per_sec,
                Instant::now().into_std(),
            )),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Waits until a token is available and takes it. Returns the total time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            let deficit = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_acquire(Instant::now().into_std()) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };
            match deficit {
                None => break,
                Some(wait) => {
                    metrics::counter!("kline.scheduler.rate_limit_waits", "exchange" => self.exchange.id())
                        .increment(1);
                    tokio::time::sleep(wait).await;
                }
            }
        }
        let waited = started.elapsed();
        if !waited.is_zero() {
            metrics::histogram!("kline.scheduler.rate_limit_wait_ms", "exchange" => self.exchange.id())
                .record(waited.as_millis() as f64);
        }
        waited
    }
}
