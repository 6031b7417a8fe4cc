//! Token-bucket rate limiter shared by all outbound catalog calls of a
//! worker. `acquire()` is the only suspension point it introduces.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Time-based token bucket. Capacity is `max(2·rate, 1)`; replenishment
/// happens lazily on acquire and is clamped to capacity.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64) -> Self {
        let rate = rate_per_sec.max(0.1);
        let capacity = (rate * 2.0).max(1.0);
        Self {
            rate,
            capacity,
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Block until a token can be consumed.
    ///
    /// The lock is never held across a sleep; contended callers re-check
    /// after waking so two tasks can never both consume the same token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (1.0 - state.tokens) / self.rate
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let bucket = TokenBucket::new(5.0);
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire().await;
        }
        // capacity is 2 * rate = 10 tokens, so a burst of 10 never sleeps
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_acquire_blocks_once_drained() {
        let bucket = TokenBucket::new(10.0);
        for _ in 0..20 {
            bucket.acquire().await;
        }
        let start = Instant::now();
        bucket.acquire().await;
        // one token takes ~100 ms to replenish at 10/s
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_overspend() {
        let bucket = TokenBucket::new(50.0);
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..150 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move { bucket.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 150 acquires at 50/s with 100 banked: at least ~1 s of waiting
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_rate_floor_prevents_zero_rate() {
        // a zero rate would deadlock acquire; the floor keeps it finite
        let bucket = TokenBucket::new(0.0);
        bucket.acquire().await;
    }
}
