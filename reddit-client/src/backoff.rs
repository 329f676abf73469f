use replybot_core::{BackoffSettings, PlatformError};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::PostResponse;

/// Configuration for retrying throttled posts
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry (in milliseconds)
    pub base_delay_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Upper bound for any single delay (in milliseconds)
    pub max_delay_ms: u64,
    /// Maximum jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Hard limit for one post call (in milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_retries: 3,
            max_delay_ms: 120_000,
            jitter_factor: 0.0,
            call_timeout_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    pub fn from_settings(settings: &BackoffSettings, call_timeout: Duration) -> Self {
        Self {
            base_delay_ms: settings.base_delay_ms,
            max_retries: settings.max_retries,
            max_delay_ms: settings.max_delay_ms,
            jitter_factor: settings.jitter_factor,
            call_timeout_ms: call_timeout.as_millis() as u64,
        }
    }
}

/// `base * 2^attempt`, capped at `max_delay`, plus optional jitter.
pub fn calculate_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    let max_delay = Duration::from_millis(config.max_delay_ms);

    let multiplier = 2u64.saturating_pow(attempt);
    let delay_ms = config
        .base_delay_ms
        .saturating_mul(multiplier)
        .min(config.max_delay_ms);
    let exponential_delay = Duration::from_millis(delay_ms);

    if config.jitter_factor <= 0.0 {
        return exponential_delay;
    }

    let jitter_range = (exponential_delay.as_millis() as f64 * config.jitter_factor) as u64;
    let jitter = fastrand::u64(0..=jitter_range);
    (exponential_delay + Duration::from_millis(jitter)).min(max_delay)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Still throttled after every retry.
    RateLimited,
    /// The call did not finish in time. It may have been posted anyway.
    Timeout,
    Platform(PlatformError),
}

impl FailureReason {
    pub fn as_reason(&self) -> String {
        match self {
            FailureReason::RateLimited => "rate_limited".to_string(),
            FailureReason::Timeout => "timeout".to_string(),
            FailureReason::Platform(e) => e.to_string(),
        }
    }

    /// True when the post may have landed despite the failure.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, FailureReason::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackoffOutcome {
    Posted { reply_id: Option<String> },
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffReport {
    pub outcome: BackoffOutcome,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

/// Wraps post calls with exponential backoff on throttling.
#[derive(Debug, Clone, Default)]
pub struct BackoffController {
    config: BackoffConfig,
}

impl BackoffController {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Runs `action` until it posts, fails permanently or runs out of retries.
    ///
    /// Only `Throttled` responses are retried. Timeouts are never retried.
    pub async fn execute<F, Fut>(&self, operation_name: &str, mut action: F) -> BackoffReport
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PostResponse>,
    {
        let call_timeout = Duration::from_millis(self.config.call_timeout_ms);
        let max_delay = Duration::from_millis(self.config.max_delay_ms);
        let mut delays = Vec::new();
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                debug!("Retry attempt {} for {}", attempt, operation_name);
            }

            let response = match timeout(call_timeout, action()).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(
                        "{} timed out after {:?}; not retrying",
                        operation_name, call_timeout
                    );
                    return self.report(BackoffOutcome::Failed(FailureReason::Timeout), attempt, delays);
                }
            };

            match response {
                PostResponse::Posted { reply_id } => {
                    if attempt > 0 {
                        info!(
                            "Operation {} succeeded after {} retries",
                            operation_name, attempt
                        );
                    }
                    return self.report(BackoffOutcome::Posted { reply_id }, attempt, delays);
                }
                PostResponse::Failed(PlatformError::RequestTimeout) => {
                    return self.report(BackoffOutcome::Failed(FailureReason::Timeout), attempt, delays);
                }
                PostResponse::Failed(error) => {
                    debug!("Not retrying {} due to error: {}", operation_name, error);
                    return self.report(
                        BackoffOutcome::Failed(FailureReason::Platform(error)),
                        attempt,
                        delays,
                    );
                }
                PostResponse::Throttled { retry_after } => {
                    if attempt >= self.config.max_retries {
                        warn!(
                            "{} still throttled after {} attempts",
                            operation_name,
                            attempt + 1
                        );
                        return self.report(
                            BackoffOutcome::Failed(FailureReason::RateLimited),
                            attempt,
                            delays,
                        );
                    }

                    let mut delay = calculate_delay(attempt, &self.config);
                    if let Some(hint) = retry_after {
                        delay = delay.max(hint.min(max_delay));
                    }

                    info!(
                        "Retrying {} in {:?} due to throttling",
                        operation_name, delay
                    );
                    delays.push(delay);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn report(&self, outcome: BackoffOutcome, attempt: u32, delays: Vec<Duration>) -> BackoffReport {
        BackoffReport {
            outcome,
            attempts: attempt + 1,
            delays,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 1,
            max_retries: 3,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
            call_timeout_ms: 200,
        }
    }

    #[test]
    fn test_calculate_delay_doubles_and_caps() {
        let config = BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            ..BackoffConfig::default()
        };
        assert_eq!(calculate_delay(0, &config), Duration::from_millis(1000));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(2000));
        assert_eq!(calculate_delay(2, &config), Duration::from_millis(4000));
        assert_eq!(calculate_delay(3, &config), Duration::from_millis(5000));
        assert_eq!(calculate_delay(40, &config), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_factor: 0.5,
            ..BackoffConfig::default()
        };
        for _ in 0..50 {
            let delay = calculate_delay(1, &config);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(3000));
        }
    }

    #[tokio::test]
    async fn test_always_throttled_is_bounded() {
        let controller = BackoffController::new(fast_config());
        let calls = AtomicU32::new(0);

        let report = controller
            .execute("post", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { PostResponse::Throttled { retry_after: None } }
            })
            .await;

        assert_eq!(report.outcome, BackoffOutcome::Failed(FailureReason::RateLimited));
        assert_eq!(report.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            report.delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4)
            ]
        );
    }

    #[tokio::test]
    async fn test_recovers_after_throttle() {
        let controller = BackoffController::new(fast_config());
        let calls = AtomicU32::new(0);

        let report = controller
            .execute("post", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        PostResponse::Throttled { retry_after: None }
                    } else {
                        PostResponse::Posted {
                            reply_id: Some("t1_reply".to_string()),
                        }
                    }
                }
            })
            .await;

        assert_eq!(
            report.outcome,
            BackoffOutcome::Posted {
                reply_id: Some("t1_reply".to_string())
            }
        );
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_hint_is_honoured_up_to_max() {
        let config = BackoffConfig {
            max_delay_ms: 20,
            ..fast_config()
        };
        let controller = BackoffController::new(config);
        let calls = AtomicU32::new(0);

        let report = controller
            .execute("post", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => PostResponse::Throttled {
                            retry_after: Some(Duration::from_millis(10)),
                        },
                        1 => PostResponse::Throttled {
                            retry_after: Some(Duration::from_secs(600)),
                        },
                        _ => PostResponse::Posted { reply_id: None },
                    }
                }
            })
            .await;

        assert_eq!(
            report.delays,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let controller = BackoffController::new(fast_config());
        let calls = AtomicU32::new(0);

        let report = controller
            .execute("post", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    PostResponse::Failed(PlatformError::Forbidden {
                        resource: "t1_a".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(
            report.outcome,
            BackoffOutcome::Failed(FailureReason::Platform(PlatformError::Forbidden { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(report.delays.is_empty());
    }

    #[tokio::test]
    async fn test_slow_call_times_out_without_retry() {
        let controller = BackoffController::new(BackoffConfig {
            call_timeout_ms: 10,
            ..fast_config()
        });
        let calls = AtomicU32::new(0);

        let report = controller
            .execute("post", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_secs(5)).await;
                    PostResponse::Posted { reply_id: None }
                }
            })
            .await;

        assert_eq!(report.outcome, BackoffOutcome::Failed(FailureReason::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(FailureReason::Timeout.is_indeterminate());
    }
}
