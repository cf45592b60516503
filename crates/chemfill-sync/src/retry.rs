//! Bounded retry with exponential backoff around a single source fetch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chemfill_adapters::FetchFailure;
use chemfill_core::{SourceFailure, SourceResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_limit_floor_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            rate_limit_floor_ms: 5_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_floor: Duration,
    pub jitter: bool,
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            rate_limit_floor: Duration::from_millis(config.rate_limit_floor_ms),
            jitter: config.jitter,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay to wait after `attempt` failed with `failure`, jitter included.
    pub fn delay_after(&self, attempt: u32, failure: &FetchFailure) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let mut delay = base;
        if self.jitter && !base.is_zero() {
            let nanos = u64::try_from(base.as_nanos()).unwrap_or(u64::MAX);
            delay += Duration::from_nanos(rand::thread_rng().gen_range(0..nanos));
        }
        if failure.is_rate_limited() {
            let floor = failure
                .retry_after()
                .map_or(self.rate_limit_floor, |after| after.max(self.rate_limit_floor));
            delay = delay.max(floor);
        }
        delay
    }
}

/// Clock used for backoff waits.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Progress of one `execute` call. Dropped when the call returns.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempt_count: u32,
    pub next_delay: Option<Duration>,
    pub last_error: Option<FetchFailure>,
}

#[derive(Clone)]
pub struct RetryController {
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Runs `attempt_fn` until it succeeds, fails permanently, or the attempt
    /// budget is spent. Never returns an error: failures are folded into the
    /// returned [`SourceResult`].
    pub async fn execute<F, Fut>(&self, source_id: &str, mut attempt_fn: F) -> SourceResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<SourceResult, FetchFailure>>,
    {
        let mut state = RetryState::default();
        loop {
            state.attempt_count += 1;
            let attempt = state.attempt_count;
            let failure = match attempt_fn().await {
                Ok(result) => return result.with_attempts(attempt),
                Err(FetchFailure::NotFound) => {
                    return SourceResult::failed(source_id, SourceFailure::NotFound, attempt)
                }
                Err(FetchFailure::Malformed(message)) => {
                    return SourceResult::failed(source_id, SourceFailure::Malformed { message }, attempt)
                }
                Err(transient) => transient,
            };

            if attempt >= self.policy.max_attempts {
                warn!(
                    source_id,
                    attempt,
                    error = %failure,
                    "retry exhausted"
                );
                return SourceResult::failed(
                    source_id,
                    SourceFailure::Exhausted {
                        attempts: attempt,
                        last_error: failure.to_string(),
                    },
                    attempt,
                );
            }

            let delay = self.policy.delay_after(attempt, &failure);
            debug!(
                source_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                rate_limited = failure.is_rate_limited(),
                error = %failure,
                "retry scheduled"
            );
            state.next_delay = Some(delay);
            state.last_error = Some(failure);
            self.sleeper.sleep(delay).await;
        }
    }
}
