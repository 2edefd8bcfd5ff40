use std::thread;
use std::time::Duration;

use rand::Rng;

use super::{GenerateError, ImageGenerator, ImageRequest};

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Backoff for provider calls.
///
/// Rate limits wait `base_delay^attempt` seconds, other retryable failures
/// wait `min(2^attempt, other_cap)` seconds; both add up to `max_jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub other_cap: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            other_cap: Duration::from_secs(10),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn no_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Delay before the attempt following `attempt` (0-based), jitter excluded.
    pub fn backoff(&self, err: &GenerateError, attempt: u32) -> Duration {
        let exponent = attempt.min(16) as i32;
        if err.is_rate_limit() {
            Duration::from_secs_f64(self.base_delay.as_secs_f64().powi(exponent))
        } else {
            Duration::from_secs_f64(2f64.powi(exponent)).min(self.other_cap)
        }
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(0.0..=self.max_jitter.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

pub struct RetryingGenerator<G, S = ThreadSleeper> {
    inner: G,
    policy: RetryPolicy,
    sleeper: S,
}

impl<G: ImageGenerator> RetryingGenerator<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self::with_sleeper(inner, policy, ThreadSleeper)
    }
}

impl<G: ImageGenerator, S: Sleeper> RetryingGenerator<G, S> {
    pub fn with_sleeper(inner: G, policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            inner,
            policy,
            sleeper,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<G: ImageGenerator, S: Sleeper> ImageGenerator for RetryingGenerator<G, S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn validate_config(&self) -> bool {
        self.inner.validate_config()
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match self.inner.generate_image(request) {
                Ok(bytes) => return Ok(bytes),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                tracing::error!(
                    provider = self.inner.name(),
                    attempts = max_attempts,
                    error = %err,
                    "image generation retries exhausted"
                );
                return Err(GenerateError::Exhausted {
                    attempts: max_attempts,
                    last: Box::new(err),
                });
            }
            let delay = self.policy.backoff(&err, attempt) + self.policy.jitter();
            tracing::warn!(
                provider = self.inner.name(),
                attempt = attempt + 2,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                rate_limited = err.is_rate_limit(),
                error = %err,
                "retrying image generation"
            );
            self.sleeper.sleep(delay);
            attempt += 1;
        }
    }
}
