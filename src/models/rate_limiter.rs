use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Length of the sliding window both ceilings are measured over.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitThresholds {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
}

impl RateLimitThresholds {
    pub fn is_unlimited(&self) -> bool {
        self.requests_per_minute.is_none() && self.tokens_per_minute.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    pub requests_remaining: Option<u32>,
    pub tokens_remaining: Option<u32>,
    /// Time until the oldest entry leaves the window.
    pub reset_in: Duration,
}

/// Per-provider sliding window. Token usage is kept as one `(instant, count)`
/// entry per recorded call with a running sum, so memory grows with calls,
/// not with tokens.
#[derive(Debug)]
struct RateLimitBucket {
    thresholds: RateLimitThresholds,
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u32)>,
    token_sum: u64,
}

impl RateLimitBucket {
    fn new(thresholds: RateLimitThresholds) -> Self {
        Self {
            thresholds,
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
            token_sum: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) >= WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some((front, count)) = self.tokens.front() {
            if now.duration_since(*front) >= WINDOW {
                self.token_sum -= u64::from(*count);
                self.tokens.pop_front();
            } else {
                break;
            }
        }
    }

    fn until_expiry(now: Instant, oldest: Option<Instant>) -> Duration {
        oldest
            .map(|at| WINDOW.saturating_sub(now.duration_since(at)))
            .unwrap_or(Duration::ZERO)
    }

    /// How long until enough token entries expire for `estimated` to fit.
    fn token_retry_after(&self, now: Instant, limit: u32, estimated: u32) -> Duration {
        if estimated > limit {
            return WINDOW;
        }
        let excess = (self.token_sum + u64::from(estimated)).saturating_sub(u64::from(limit));
        let mut freed = 0u64;
        for (at, count) in &self.tokens {
            freed += u64::from(*count);
            if freed >= excess {
                return Self::until_expiry(now, Some(*at));
            }
        }
        WINDOW
    }

    fn check_and_consume(&mut self, now: Instant, estimated_tokens: u32) -> std::result::Result<(), Duration> {
        self.prune(now);

        if let Some(limit) = self.thresholds.requests_per_minute {
            if self.requests.len() as u64 >= u64::from(limit) {
                return Err(Self::until_expiry(now, self.requests.front().copied()));
            }
        }

        if let Some(limit) = self.thresholds.tokens_per_minute {
            if self.token_sum + u64::from(estimated_tokens) > u64::from(limit) {
                return Err(self.token_retry_after(now, limit, estimated_tokens));
            }
        }

        self.requests.push_back(now);
        Ok(())
    }

    fn record_tokens(&mut self, now: Instant, tokens: u32) {
        if tokens == 0 || self.thresholds.tokens_per_minute.is_none() {
            return;
        }
        self.prune(now);
        self.tokens.push_back((now, tokens));
        self.token_sum += u64::from(tokens);
    }

    fn state(&mut self, now: Instant) -> RateLimitState {
        self.prune(now);
        let requests_remaining = self
            .thresholds
            .requests_per_minute
            .map(|limit| limit.saturating_sub(self.requests.len() as u32));
        let tokens_remaining = self.thresholds.tokens_per_minute.map(|limit| {
            u64::from(limit).saturating_sub(self.token_sum) as u32
        });
        let oldest = match (self.requests.front(), self.tokens.front()) {
            (Some(r), Some((t, _))) => Some((*r).min(*t)),
            (Some(r), None) => Some(*r),
            (None, Some((t, _))) => Some(*t),
            (None, None) => None,
        };
        RateLimitState {
            requests_remaining,
            tokens_remaining,
            reset_in: Self::until_expiry(now, oldest),
        }
    }
}

/// Sliding-window request/token budgets keyed by provider name. A failed
/// check returns immediately; callers decide whether to wait or fall back.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, RateLimitBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, provider: &str, thresholds: RateLimitThresholds) {
        let mut buckets = self.buckets.lock();
        if thresholds.is_unlimited() {
            buckets.remove(provider);
            debug!("Rate limiting disabled for {}", provider);
            return;
        }
        info!(
            "Rate limits for {}: {:?} requests/min, {:?} tokens/min",
            provider, thresholds.requests_per_minute, thresholds.tokens_per_minute
        );
        match buckets.get_mut(provider) {
            Some(bucket) => bucket.thresholds = thresholds,
            None => {
                buckets.insert(provider.to_string(), RateLimitBucket::new(thresholds));
            }
        }
    }

    pub fn is_limited(&self, provider: &str) -> bool {
        self.buckets.lock().contains_key(provider)
    }

    pub fn check_and_consume(&self, provider: &str, estimated_tokens: u32) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(provider) else {
            return Ok(());
        };

        bucket
            .check_and_consume(Instant::now(), estimated_tokens)
            .map_err(|retry_after| {
                warn!(
                    provider,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Error::RateLimited {
                    provider: provider.to_string(),
                    retry_after,
                }
            })
    }

    /// Records actual usage once a call completes.
    pub fn record_token_usage(&self, provider: &str, tokens: u32) {
        if let Some(bucket) = self.buckets.lock().get_mut(provider) {
            bucket.record_tokens(Instant::now(), tokens);
        }
    }

    pub fn get_state(&self, provider: &str) -> Option<RateLimitState> {
        self.buckets
            .lock()
            .get_mut(provider)
            .map(|bucket| bucket.state(Instant::now()))
    }
}
