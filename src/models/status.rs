use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::models::provider::HealthCheckResult;

/// Weight of the newest sample in the rolling latency average.
const LATENCY_EMA_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub average_latency_ms: Option<f64>,
    pub models_healthy: usize,
    pub models_unhealthy: usize,
    pub last_error: Option<String>,
    #[serde(skip)]
    model_health: BTreeMap<String, bool>,
}

impl ProviderStatus {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            healthy: true,
            last_check: None,
            consecutive_failures: 0,
            average_latency_ms: None,
            models_healthy: 0,
            models_unhealthy: 0,
            last_error: None,
            model_health: BTreeMap::new(),
        }
    }

    fn observe_latency(&mut self, latency_ms: u64) {
        let sample = latency_ms as f64;
        self.average_latency_ms = Some(match self.average_latency_ms {
            Some(avg) => avg * (1.0 - LATENCY_EMA_WEIGHT) + sample * LATENCY_EMA_WEIGHT,
            None => sample,
        });
    }

    fn set_model_health(&mut self, model: &str, healthy: bool) {
        self.model_health.insert(model.to_string(), healthy);
        self.models_healthy = self.model_health.values().filter(|h| **h).count();
        self.models_unhealthy = self.model_health.len() - self.models_healthy;
    }

    pub fn model_health(&self) -> &BTreeMap<String, bool> {
        &self.model_health
    }
}

/// Soft per-provider health used to order candidates. Independent of the
/// circuit breakers, which block dispatch outright.
#[derive(Debug)]
pub struct ProviderStatusTracker {
    unhealthy_threshold: u32,
    statuses: RwLock<HashMap<String, ProviderStatus>>,
}

impl ProviderStatusTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            unhealthy_threshold: unhealthy_threshold.max(1),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider: &str) {
        self.statuses
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| ProviderStatus::new(provider));
    }

    pub fn record_success(&self, provider: &str, model: &str, latency_ms: u64) {
        let mut statuses = self.statuses.write();
        let status = statuses
            .entry(provider.to_string())
            .or_insert_with(|| ProviderStatus::new(provider));
        if !status.healthy {
            info!(provider, "Provider recovered");
        }
        status.healthy = true;
        status.consecutive_failures = 0;
        status.last_error = None;
        status.observe_latency(latency_ms);
        status.set_model_health(model, true);
    }

    pub fn record_failure(&self, provider: &str, model: &str, error: &str) {
        let mut statuses = self.statuses.write();
        let status = statuses
            .entry(provider.to_string())
            .or_insert_with(|| ProviderStatus::new(provider));
        status.consecutive_failures += 1;
        status.last_error = Some(error.to_string());
        status.set_model_health(model, false);
        if status.healthy && status.consecutive_failures >= self.unhealthy_threshold {
            status.healthy = false;
            warn!(
                provider,
                consecutive_failures = status.consecutive_failures,
                "Provider marked unhealthy"
            );
        }
    }

    pub fn apply_health_check(&self, result: &HealthCheckResult) {
        match (result.healthy, result.latency_ms) {
            (true, latency) => {
                self.record_success(&result.provider, &result.model, latency.unwrap_or(0))
            }
            (false, _) => self.record_failure(
                &result.provider,
                &result.model,
                result.error.as_deref().unwrap_or("health check failed"),
            ),
        }
        if let Some(status) = self.statuses.write().get_mut(&result.provider) {
            status.last_check = Some(result.checked_at);
        }
    }

    pub fn is_healthy(&self, provider: &str) -> bool {
        self.statuses
            .read()
            .get(provider)
            .map_or(true, |s| s.healthy)
    }

    pub fn get(&self, provider: &str) -> Option<ProviderStatus> {
        self.statuses.read().get(provider).cloned()
    }

    pub fn all(&self) -> Vec<ProviderStatus> {
        let mut all: Vec<ProviderStatus> = self.statuses.read().values().cloned().collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_after_threshold_and_recovery() {
        let tracker = ProviderStatusTracker::new(3);
        tracker.register("openai");
        assert!(tracker.is_healthy("openai"));

        tracker.record_failure("openai", "gpt-4o", "503");
        tracker.record_failure("openai", "gpt-4o", "503");
        assert!(tracker.is_healthy("openai"));
        tracker.record_failure("openai", "gpt-4o", "503");
        assert!(!tracker.is_healthy("openai"));

        tracker.record_success("openai", "gpt-4o-mini", 100);
        let status = tracker.get("openai").unwrap();
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.models_healthy, 1);
        assert_eq!(status.models_unhealthy, 1);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_latency_is_exponentially_averaged() {
        let tracker = ProviderStatusTracker::new(3);
        tracker.record_success("anthropic", "claude", 100);
        tracker.record_success("anthropic", "claude", 200);
        let avg = tracker.get("anthropic").unwrap().average_latency_ms.unwrap();
        assert!((avg - 130.0).abs() < f64::EPSILON * 1000.0);
    }

    #[test]
    fn test_health_check_result_updates_last_check() {
        let tracker = ProviderStatusTracker::new(3);
        let result = HealthCheckResult::unhealthy("gemini", "gemini-1.5-flash", "timeout");
        tracker.apply_health_check(&result);

        let status = tracker.get("gemini").unwrap();
        assert_eq!(status.last_check, Some(result.checked_at));
        assert_eq!(status.last_error.as_deref(), Some("timeout"));
        assert_eq!(status.consecutive_failures, 1);
        assert!(tracker.is_healthy("gemini"));
        assert!(tracker.is_healthy("never-seen"));
    }
}
