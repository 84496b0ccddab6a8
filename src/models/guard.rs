use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::models::provider::InFlightGuard;
use crate::models::rate_limiter::{RateLimitThresholds, RateLimiter};
use crate::models::retry::{with_retry, RetryPolicy};

/// The breaker, limiter and retry pipeline every provider call goes through.
/// One instance is shared between all providers and the manager so that
/// skip decisions and dispatch see the same state.
#[derive(Debug)]
pub struct CallGuard {
    breakers: CircuitBreakerRegistry,
    limiter: RateLimiter,
    default_retry: RetryPolicy,
    retry_overrides: RwLock<HashMap<String, RetryPolicy>>,
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), RetryPolicy::default())
    }
}

impl CallGuard {
    pub fn new(breaker_config: CircuitBreakerConfig, default_retry: RetryPolicy) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(breaker_config),
            limiter: RateLimiter::new(),
            default_retry,
            retry_overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn configure_rate_limits(&self, provider: &str, thresholds: RateLimitThresholds) {
        self.limiter.configure(provider, thresholds);
    }

    pub fn set_retry_policy(&self, provider: &str, policy: RetryPolicy) {
        self.retry_overrides.write().insert(provider.to_string(), policy);
    }

    pub fn retry_policy(&self, provider: &str) -> RetryPolicy {
        self.retry_overrides
            .read()
            .get(provider)
            .cloned()
            .unwrap_or_else(|| self.default_retry.clone())
    }

    pub fn is_open(&self, provider: &str, model: &str) -> bool {
        self.breakers.is_open(provider, model)
    }

    pub fn record_token_usage(&self, provider: &str, tokens: u32) {
        self.limiter.record_token_usage(provider, tokens);
    }

    /// Runs `operation` for `provider:model`: rejects when the breaker is
    /// open, consumes rate-limit budget once, then retries retryable
    /// failures. The breaker sees one outcome per guarded call, after
    /// retries are exhausted. Cancelling `request` aborts the call,
    /// including any backoff in progress.
    pub async fn execute<F, Fut, T>(
        &self,
        provider: &str,
        model: &str,
        estimated_tokens: u32,
        request: &InFlightGuard,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get(provider, model);
        if !breaker.allow_request() {
            return Err(Error::CircuitOpen {
                key: breaker.name().to_string(),
            });
        }

        if let Err(e) = self.limiter.check_and_consume(provider, estimated_tokens) {
            breaker.release_trial();
            return Err(e);
        }

        let policy = self.retry_policy(provider);
        let outcome = tokio::select! {
            biased;
            _ = request.token().cancelled() => Err(Error::Cancelled(request.request_id().to_string())),
            outcome = with_retry(provider, &policy, operation) => outcome,
        };
        match outcome {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(error) => {
                if error.counts_against_health() {
                    breaker.record_failure();
                } else {
                    debug!(provider, model, %error, "Guarded call ended without a health verdict");
                    breaker.release_trial();
                }
                Err(error)
            }
        }
    }
}
