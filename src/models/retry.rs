use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "crate::app::config::duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "crate::app::config::duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction in `[0, 1]`; the delay is scaled by a factor drawn from
    /// `1 ± jitter`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Backoff before the retry following failed attempt `attempt`
    /// (zero-based), before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// Jittered backoff, raised to `retry_after` when the upstream supplied
    /// a longer hint. A hint never raises the delay past `max_delay`.
    pub fn calculate_retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
            Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
        } else {
            delay
        };

        match retry_after {
            Some(hint) if hint > delay => hint.min(self.max_delay.max(delay)),
            _ => delay,
        }
    }
}

/// Runs `operation`, retrying retryable failures up to `policy.max_retries`
/// times. Non-retryable errors and the last failure propagate unchanged.
pub async fn with_retry<F, Fut, T>(provider: &str, policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(provider, attempt, "Request succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() {
                    debug!(provider, %error, "Non-retryable error");
                    return Err(error);
                }
                if attempt >= policy.max_retries {
                    warn!(provider, attempts = attempt + 1, %error, "Retry budget exhausted");
                    return Err(error);
                }

                if let Some(hint) = error.retry_after().filter(|hint| *hint > policy.max_delay) {
                    warn!(
                        provider,
                        retry_after_ms = hint.as_millis() as u64,
                        %error,
                        "Retry-After exceeds max delay, giving up"
                    );
                    return Err(error);
                }

                let delay = policy.calculate_retry_delay(attempt, error.retry_after());
                warn!(
                    provider,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Retrying request"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
