//! Bounded retry with exponential backoff and jitter.
//!
//! # Purpose
//! Shared by the record engine (compare-and-swap conflicts) and the instance
//! orchestrator (scheduler calls). Policies are plain data so they can be
//! loaded from configuration.
use crate::observability;
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Total number of attempts, including the first one. Zero behaves like one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier applied to the delay after every failed attempt
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Fraction of the delay added as random jitter, in `[0, 1]`
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Upper bound for a single delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    10
}
fn default_factor() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}
fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::cas_default()
    }
}

impl BackoffPolicy {
    /// Retry policy for optimistic-concurrency conflicts on unpinned updates.
    /// Five attempts, doubling from 10ms.
    pub fn cas_default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// Retry policy for scheduler calls. Nine attempts, doubling from 10ms.
    pub fn scheduling_default() -> Self {
        Self {
            max_attempts: 9,
            base_delay_ms: 10,
            factor: 2.0,
            jitter: 0.1,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// Delay after the failed attempt number `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = (self.base_delay_ms as f64) * self.factor.max(1.0).powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=jitter);
        delay.mul_f64(1.0 + extra)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. The last error is returned unchanged.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    operation: &'static str,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_retryable(&err) => {
                let delay = policy.jittered(policy.delay_for(attempt));
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                metrics::counter!(observability::RETRIES, "operation" => operation).increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if attempt > 1 {
                    tracing::warn!(operation, attempts = attempt, error = %err, "giving up");
                }
                return Err(err);
            }
        }
    }
}
