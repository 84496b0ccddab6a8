//! Scripted in-process provider for exercising the manager without a
//! network.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::guard::CallGuard;
use crate::models::provider::{
    estimate_prompt_tokens, estimate_text_tokens, resolve_model_id, CompletionOptions,
    CompletionResult, FinishReason, HealthCheckResult, InFlightRequests, ModelInfo,
    ModelProvider, QualityTier, SpeedTier, TokenUsage,
};
use crate::models::streaming::ChatStream;

/// What the next attempt against the provider does.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Reply(String),
    FailStatus(u16),
    FailAuth,
    /// Blocks until the request is cancelled.
    Hang,
}

pub struct ScriptedProvider {
    name: String,
    default_model: String,
    models: Vec<ModelInfo>,
    script: Mutex<VecDeque<ScriptStep>>,
    default_step: ScriptStep,
    attempts: AtomicU32,
    dispatched: Mutex<Vec<String>>,
    requests: Mutex<Vec<CompletionOptions>>,
    healthy: AtomicBool,
    latency: Duration,
    guard: Arc<CallGuard>,
    in_flight: InFlightRequests,
}

impl ScriptedProvider {
    pub fn new(name: &str, models: &[&str], guard: Arc<CallGuard>) -> Self {
        let catalog: Vec<ModelInfo> = models
            .iter()
            .map(|id| {
                ModelInfo::priced(
                    name,
                    id,
                    id,
                    8_192,
                    1_024,
                    Decimal::new(1, 3),
                    Decimal::new(2, 3),
                    QualityTier::Standard,
                    SpeedTier::Fast,
                )
            })
            .collect();
        Self {
            name: name.to_string(),
            default_model: models.first().copied().unwrap_or("mock-model").to_string(),
            models: catalog,
            script: Mutex::new(VecDeque::new()),
            default_step: ScriptStep::Reply(format!("reply from {}", name)),
            attempts: AtomicU32::new(0),
            dispatched: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            latency: Duration::ZERO,
            guard,
            in_flight: InFlightRequests::new(),
        }
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    /// Step used once the script runs out.
    pub fn with_default_step(mut self, step: ScriptStep) -> Self {
        self.default_step = step;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_step(&self, step: ScriptStep) {
        self.script.lock().push_back(step);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Attempts that reached the provider, retries included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Model ids of every attempt, in order.
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().clone()
    }

    /// Options of the most recent `complete` or `stream` call.
    pub fn last_request(&self) -> Option<CompletionOptions> {
        self.requests.lock().last().cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn next_step(&self) -> ScriptStep {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone())
    }

    async fn attempt(&self, model: &str, cancel: &CancellationToken, request_id: &str) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.dispatched.lock().push(model.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.next_step() {
            ScriptStep::Reply(text) => Ok(text),
            ScriptStep::FailStatus(status) => Err(Error::provider_status(
                &self.name,
                status,
                format!("scripted failure {}", status),
                None,
            )),
            ScriptStep::FailAuth => Err(Error::authentication(&self.name, "scripted bad credentials")),
            ScriptStep::Hang => {
                cancel.cancelled().await;
                Err(Error::Cancelled(request_id.to_string()))
            }
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn get_provider_name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn get_models(&self) -> &[ModelInfo] {
        &self.models
    }

    async fn complete(&self, options: CompletionOptions) -> Result<CompletionResult> {
        self.requests.lock().push(options.clone());
        let model = resolve_model_id(options.model.as_deref(), &self.name, &self.default_model);
        let request = self.in_flight.register(&options.request_id);
        let start = tokio::time::Instant::now();

        let content = self
            .guard
            .execute(&self.name, &model, options.estimated_tokens(256), &request, |_| {
                self.attempt(&model, request.token(), &options.request_id)
            })
            .await?;

        let usage = TokenUsage::new(
            estimate_prompt_tokens(&options.messages),
            estimate_text_tokens(&content),
        );
        self.guard.record_token_usage(&self.name, usage.total_tokens);
        Ok(CompletionResult {
            id: Uuid::new_v4().to_string(),
            request_id: options.request_id.clone(),
            provider: self.name.clone(),
            model,
            content,
            finish_reason: FinishReason::Stop,
            usage,
            tool_calls: Vec::new(),
            latency_ms: start.elapsed().as_millis() as u64,
            cached: false,
            created_at: Utc::now(),
        })
    }

    async fn stream(&self, options: CompletionOptions) -> Result<ChatStream> {
        self.requests.lock().push(options.clone());
        let model = resolve_model_id(options.model.as_deref(), &self.name, &self.default_model);
        let request = self.in_flight.register(&options.request_id);

        let content = self
            .guard
            .execute(&self.name, &model, options.estimated_tokens(256), &request, |_| {
                self.attempt(&model, request.token(), &options.request_id)
            })
            .await?;

        let usage = TokenUsage::new(
            estimate_prompt_tokens(&options.messages),
            estimate_text_tokens(&content),
        );
        let (mut sender, stream) = ChatStream::channel(&options.request_id, request.token().clone());
        tokio::spawn(async move {
            let _request = request;
            for piece in content.split_inclusive(' ') {
                if !sender.send_delta(piece.to_string(), None).await {
                    return;
                }
            }
            sender.finish(FinishReason::Stop, Some(usage)).await;
        });
        Ok(stream)
    }

    async fn health_check(&self, model: Option<&str>) -> HealthCheckResult {
        let model = resolve_model_id(model, &self.name, &self.default_model);
        if self.healthy.load(Ordering::SeqCst) {
            HealthCheckResult::healthy(&self.name, &model, self.latency.as_millis() as u64)
        } else {
            HealthCheckResult::unhealthy(&self.name, &model, "scripted health failure")
        }
    }

    fn cancel(&self, request_id: Option<&str>) -> usize {
        self.in_flight.cancel(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::Message;
    use crate::models::retry::RetryPolicy;
    use crate::models::circuit_breaker::CircuitBreakerConfig;

    fn guard() -> Arc<CallGuard> {
        CallGuard::new(CircuitBreakerConfig::default(), RetryPolicy::no_retries()).shared()
    }

    #[tokio::test]
    async fn test_script_is_consumed_in_order() {
        let provider = ScriptedProvider::new("a", &["m1"], guard())
            .with_script([ScriptStep::FailStatus(500), ScriptStep::Reply("second".to_string())]);

        let first = provider
            .complete(CompletionOptions::new(vec![Message::user("hi")]))
            .await;
        assert!(matches!(first, Err(Error::Provider { status: Some(500), .. })));

        let second = provider
            .complete(CompletionOptions::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(second.content, "second");
        assert_eq!(provider.attempts(), 2);
        assert_eq!(provider.dispatched(), vec!["m1", "m1"]);
    }

    #[tokio::test]
    async fn test_stream_splits_words() {
        let provider = ScriptedProvider::new("a", &["m1"], guard())
            .with_script([ScriptStep::Reply("one two three".to_string())]);
        let stream = provider
            .stream(CompletionOptions::new(vec![Message::user("count")]))
            .await
            .unwrap();
        let summary = stream.collect().await.unwrap();
        assert_eq!(summary.content, "one two three");
        assert_eq!(summary.chunks, 4);
    }

    #[tokio::test]
    async fn test_hang_until_cancelled() {
        let provider = Arc::new(
            ScriptedProvider::new("a", &["m1"], guard()).with_script([ScriptStep::Hang]),
        );
        let options = CompletionOptions::new(vec![Message::user("wait")]).with_request_id("req-hang");

        let task = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.complete(options).await })
        };
        while provider.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.cancel(Some("req-hang")), 1);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(id)) if id == "req-hang"));
        assert_eq!(provider.in_flight(), 0);
    }
}
