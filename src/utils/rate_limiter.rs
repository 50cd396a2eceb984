/// Token bucket limiter for outbound exchange requests
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: u32,
    refill_every: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let capacity = requests_per_second.max(1);
        RateLimiter {
            capacity,
            refill_every: Duration::from_secs(1),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it
    pub async fn acquire(&self) {
        while !self.try_acquire().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed();
        if elapsed >= self.refill_every {
            let periods = (elapsed.as_secs_f64() / self.refill_every.as_secs_f64()) as u32;
            bucket.tokens = bucket
                .tokens
                .saturating_add(periods.saturating_mul(self.capacity))
                .min(self.capacity);
            bucket.last_refill = Instant::now();
        }
    }
}
