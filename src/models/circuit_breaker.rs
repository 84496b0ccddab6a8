use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::app::config::duration_secs")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            "Creating circuit breaker '{}' with threshold {} and timeout {:?}",
            name, config.failure_threshold, config.recovery_timeout
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(self.config.recovery_timeout);
        if elapsed >= self.config.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!("Circuit breaker '{}' transitioning to half-open", self.name);
        }
    }

    /// True while the circuit rejects calls. Once the recovery window has
    /// passed the circuit silently becomes half-open and this returns false.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state == CircuitState::Open
    }

    /// Admits a call. In half-open only one trial call is admitted until it
    /// reports back.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                debug!("Circuit breaker '{}' is open, rejecting call", self.name);
                false
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!("Circuit breaker '{}' already has a trial call in flight", self.name);
                    false
                } else {
                    inner.trial_in_flight = true;
                    debug!("Circuit breaker '{}' is half-open, allowing single test call", self.name);
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.failure_count;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                info!("Circuit breaker '{}' recovered, transitioning to closed", self.name);
            }
            CircuitState::Closed => {
                if previous > 0 {
                    debug!("Circuit breaker '{}' reset failure count from {}", self.name, previous);
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        debug!(
            "Circuit breaker '{}' failure count: {}/{}",
            self.name, inner.failure_count, self.config.failure_threshold
        );

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!("Circuit breaker '{}' re-opened during half-open test", self.name);
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    "Circuit breaker '{}' opened due to {} consecutive failures",
                    self.name, inner.failure_count
                );
            }
            _ => {}
        }
    }

    /// Gives back a half-open trial slot when the call ended without a
    /// verdict on the target's health.
    pub fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    pub fn get_state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn get_failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn get_stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
        }
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.allow_request() {
            return Err(Error::CircuitOpen {
                key: self.name.clone(),
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if error.counts_against_health() {
                    self.record_failure();
                } else {
                    self.release_trial();
                }
                Err(error)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

/// Breakers keyed by `provider:model`, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(provider: &str, model: &str) -> String {
        format!("{}:{}", provider, model)
    }

    pub fn get(&self, provider: &str, model: &str) -> Arc<CircuitBreaker> {
        let key = Self::key(provider, model);
        self.breakers
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config)))
            .clone()
    }

    /// Looks up an existing breaker without creating one.
    pub fn find(&self, provider: &str, model: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(&Self::key(provider, model)).cloned()
    }

    pub fn is_open(&self, provider: &str, model: &str) -> bool {
        self.find(provider, model).map_or(false, |b| b.is_open())
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut stats: Vec<CircuitBreakerStats> = breakers.iter().map(|b| b.get_stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
