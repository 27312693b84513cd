use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

use super::RateLimiter;

/**
 * Default `RateLimiter`: a single token bucket refilled at a fixed rate.
 *
 * `acquire` suspends the caller until enough tokens have accumulated rather
 * than failing outright. Exchange-specific weight tables and multi-bucket
 * policies are expected to wrap or replace this with their own `RateLimiter`
 * impl.
 */
#[derive(Debug, Clone)]
pub struct TokenBucketLimiter {
    inner: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bucket {
                capacity: capacity as f64,
                tokens: capacity as f64,
                refill_per_sec: refill_per_sec as f64,
                last_refill: Instant::now(),
            })),
        }
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn wait_for(&self, weight: f64) -> Option<Duration> {
        if self.tokens >= weight {
            None
        } else {
            let deficit = weight - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self, weight: u32) -> Result<()> {
        let weight = weight as f64;
        loop {
            let wait = {
                let mut bucket = self.inner.lock().await;
                bucket.refill();
                match bucket.wait_for(weight) {
                    None => {
                        bucket.tokens -= weight;
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };
            debug!(?wait, weight, "rate limiter suspending send");
            tokio::time::sleep(wait).await;
        }
    }
}
