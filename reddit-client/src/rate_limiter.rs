use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub time_window: Duration,
    pub burst_allowance: u32,
}

impl RateLimitConfig {
    pub fn reddit_oauth() -> Self {
        Self {
            max_requests: 100, // Reddit allows 100 requests per minute for OAuth2
            time_window: Duration::from_secs(60),
            burst_allowance: 10,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::reddit_oauth()
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Set when the server reports an exhausted quota.
    blocked_until: Option<Instant>,
}

/// Token bucket shared by every request a client makes.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst_allowance.max(1));
        let refill_rate = f64::from(config.max_requests) / config.time_window.as_secs_f64();

        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
            capacity,
            refill_rate,
        }
    }

    /// Takes one token, or reports how long to wait for the next one.
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if let Some(until) = state.blocked_until {
            if until > now {
                return Err(until - now);
            }
            state.blocked_until = None;
        }

        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    pub async fn available_tokens(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = Instant::now().duration_since(state.last_refill);
        (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity)
    }

    /// Empties the bucket until `reset` has passed.
    pub async fn block_for(&self, reset: Duration) {
        let mut state = self.state.lock().await;
        state.tokens = 0.0;
        state.blocked_until = Some(Instant::now() + reset);
    }
}

/// Paces outgoing HTTP requests to the platform's published budget.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: TokenBucket,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: TokenBucket::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits until a request may be sent. Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();
        loop {
            match self.bucket.try_acquire().await {
                Ok(()) => return start.elapsed(),
                Err(wait_time) => {
                    debug!("Rate limit reached, waiting {:?}", wait_time);
                    sleep(wait_time).await;
                }
            }
        }
    }

    /// Applies the `x-ratelimit-remaining` / `x-ratelimit-reset` headers.
    pub async fn observe_quota(&self, remaining: Option<f64>, reset: Option<Duration>) {
        if let (Some(remaining), Some(reset)) = (remaining, reset) {
            if remaining < 1.0 {
                debug!("Server quota exhausted, pausing requests for {:?}", reset);
                self.bucket.block_for(reset).await;
            }
        }
    }

    pub async fn available_tokens(&self) -> f64 {
        self.bucket.available_tokens().await
    }
}
