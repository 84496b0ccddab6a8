//! Request routing across providers.
//!
//! The manager turns a request into an ordered list of `provider:model`
//! candidates and walks it until one succeeds. Circuit-open candidates are
//! skipped, as are providers past the unhealthy threshold unless no healthy
//! candidate is left. Every outcome feeds provider status, cost tracking and
//! the query log.

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::config::{HealthCheckConfig, OrchestratorConfig, ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::models::anthropic::AnthropicProvider;
use crate::models::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::models::gemini::GeminiProvider;
use crate::models::guard::CallGuard;
use crate::models::openai::OpenAIProvider;
use crate::models::provider::{
    estimate_prompt_tokens, estimate_text_tokens, CompletionOptions, CompletionResult,
    HealthCheckResult, Message, ModelInfo, ModelProvider, TokenUsage,
};
use crate::models::status::{ProviderStatus, ProviderStatusTracker};
use crate::models::streaming::{ChatStream, StreamSender};
use crate::models::use_case::{default_mappings, ModelRef, UseCase, UseCaseModelMapping};
use crate::platform::AppPaths;
use crate::storage::{
    CostEntry, CostRecord, CostSummary, CostTracker, Database, JsonFileCostStore, QueryLog,
    QueryLogEntry,
};

/// Upper bound on a single provider check during health checks.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of one dispatch, carried into status, cost and query-log
/// bookkeeping.
#[derive(Debug, Clone)]
struct Attempt {
    request_id: String,
    provider: String,
    model: String,
    use_case: Option<String>,
    prompt: String,
    prompt_tokens: u32,
}

/// Where call outcomes are recorded. Cloned into stream relay tasks.
#[derive(Clone)]
struct Outcomes {
    status: Arc<ProviderStatusTracker>,
    costs: Option<Arc<CostTracker>>,
    query_log: Option<QueryLog>,
}

impl Outcomes {
    async fn succeeded(&self, attempt: &Attempt, usage: TokenUsage, latency_ms: u64, cached: bool) {
        self.status
            .record_success(&attempt.provider, &attempt.model, latency_ms);

        if let Some(costs) = &self.costs {
            costs
                .record_cost(CostEntry {
                    provider: attempt.provider.clone(),
                    model: attempt.model.clone(),
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    latency_ms,
                    use_case: attempt.use_case.clone(),
                    cached,
                })
                .await;
        }

        self.log_query(attempt, true, latency_ms, usage.total_tokens, None)
            .await;
    }

    async fn failed(&self, attempt: &Attempt, error: &Error, latency_ms: u64) {
        if error.counts_against_health() {
            self.status
                .record_failure(&attempt.provider, &attempt.model, &error.to_string());
        }
        self.log_query(attempt, false, latency_ms, 0, Some(error.to_string()))
            .await;
    }

    async fn log_query(
        &self,
        attempt: &Attempt,
        success: bool,
        latency_ms: u64,
        total_tokens: u32,
        error: Option<String>,
    ) {
        let Some(query_log) = &self.query_log else {
            return;
        };
        let entry = QueryLogEntry {
            request_id: attempt.request_id.clone(),
            timestamp: chrono::Utc::now(),
            provider: attempt.provider.clone(),
            model: attempt.model.clone(),
            use_case: attempt.use_case.clone(),
            prompt_prefix: attempt.prompt.clone(),
            success,
            latency_ms,
            total_tokens,
            error,
        };
        if let Err(e) = query_log.record(&entry).await {
            warn!("Failed to write query log entry: {}", e);
        }
    }
}

/// A request after candidate resolution and use-case defaults.
struct RequestPlan {
    candidates: Vec<ModelRef>,
    options: CompletionOptions,
    use_case: Option<UseCase>,
    label: String,
}

impl RequestPlan {
    fn attempt(&self, candidate: &ModelRef) -> Attempt {
        Attempt {
            request_id: self.options.request_id.clone(),
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
            use_case: self.use_case.map(|u| u.as_str().to_string()),
            prompt: self
                .options
                .last_user_message()
                .unwrap_or_default()
                .to_string(),
            prompt_tokens: estimate_prompt_tokens(&self.options.messages),
        }
    }
}

struct HealthMonitor {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ModelManagerBuilder {
    guard: Arc<CallGuard>,
    unhealthy_threshold: u32,
    mappings: HashMap<UseCase, UseCaseModelMapping>,
    providers: Vec<Arc<dyn ModelProvider>>,
    cost_tracker: Option<Arc<CostTracker>>,
    query_log: Option<QueryLog>,
    database: Option<Database>,
}

impl ModelManagerBuilder {
    pub fn new(guard: Arc<CallGuard>) -> Self {
        Self {
            guard,
            unhealthy_threshold: 3,
            mappings: default_mappings(),
            providers: Vec::new(),
            cost_tracker: None,
            query_log: None,
            database: None,
        }
    }

    /// The guard providers must be constructed with.
    pub fn guard(&self) -> Arc<CallGuard> {
        self.guard.clone()
    }

    pub fn unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    pub fn use_case(mut self, use_case: UseCase, mapping: UseCaseModelMapping) -> Self {
        self.mappings.insert(use_case, mapping);
        self
    }

    /// Replaces every mapping.
    pub fn use_cases(
        mut self,
        mappings: impl IntoIterator<Item = (UseCase, UseCaseModelMapping)>,
    ) -> Self {
        self.mappings = mappings.into_iter().collect();
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost_tracker = Some(tracker);
        self
    }

    pub fn query_log(mut self, query_log: QueryLog) -> Self {
        self.query_log = Some(query_log);
        self
    }

    fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn build(self) -> ModelManager {
        let manager = ModelManager {
            providers: RwLock::new(Vec::new()),
            mappings: RwLock::new(self.mappings),
            guard: self.guard,
            outcomes: Outcomes {
                status: Arc::new(ProviderStatusTracker::new(self.unhealthy_threshold)),
                costs: self.cost_tracker,
                query_log: self.query_log,
            },
            database: Mutex::new(self.database),
            health_monitor: Mutex::new(None),
        };
        for provider in self.providers {
            manager.add_provider(provider);
        }
        manager
    }
}

/// Owns the providers and routes every completion through them.
pub struct ModelManager {
    /// Registration order; short model ids resolve to the first match.
    providers: RwLock<Vec<Arc<dyn ModelProvider>>>,
    mappings: RwLock<HashMap<UseCase, UseCaseModelMapping>>,
    guard: Arc<CallGuard>,
    outcomes: Outcomes,
    database: Mutex<Option<Database>>,
    health_monitor: Mutex<Option<HealthMonitor>>,
}

impl ModelManager {
    pub fn builder(guard: Arc<CallGuard>) -> ModelManagerBuilder {
        ModelManagerBuilder::new(guard)
    }

    /// Builds providers, cost tracking and the query log from configuration.
    /// Providers that cannot be constructed are skipped with a warning.
    pub async fn initialize(config: &OrchestratorConfig, paths: &AppPaths) -> Result<Self> {
        info!("Initializing model manager");
        let guard =
            CallGuard::new(config.resilience.circuit_breaker, config.default_retry_policy()).shared();

        let mut builder = ModelManager::builder(guard.clone())
            .unhealthy_threshold(config.resilience.unhealthy_threshold)
            .use_cases(config.use_case_mappings()?);

        for (name, provider_config) in &config.providers {
            if !provider_config.enabled {
                debug!(provider = %name, "Provider disabled");
                continue;
            }
            guard.configure_rate_limits(name, provider_config.rate_limits);
            guard.set_retry_policy(name, config.retry_policy_for(name));

            match build_provider(name, provider_config, config.provider_timeout(name), guard.clone()) {
                Ok(provider) => {
                    info!(provider = %name, default_model = provider.default_model(), "Provider enabled");
                    builder = builder.provider(provider);
                }
                Err(e) => warn!(provider = %name, error = %e, "Skipping provider"),
            }
        }

        if config.cost_tracking.enabled {
            let store = Arc::new(JsonFileCostStore::new(config.cost_file(paths)));
            builder = builder.cost_tracker(Arc::new(CostTracker::new(
                store,
                config.cost_tracking.max_records,
                config.cost_debounce(),
            )));
        }

        if config.query_log.enabled {
            match Database::open(&config.query_log_database(paths)).await {
                Ok(database) => {
                    let query_log =
                        QueryLog::new(database.pool().clone(), config.query_log.prompt_prefix_chars);
                    builder = builder.query_log(query_log).database(database);
                }
                Err(e) => warn!("Query log disabled, database unavailable: {}", e),
            }
        }

        let manager = builder.build();
        if manager.provider_names().is_empty() {
            warn!("No providers enabled; set OPENAI_API_KEY, ANTHROPIC_API_KEY or GEMINI_API_KEY");
        }
        Ok(manager)
    }

    /// [`initialize`](Self::initialize), then starts the periodic health
    /// monitor when `health_check.enabled` is set.
    pub async fn start(config: &OrchestratorConfig, paths: &AppPaths) -> Result<Arc<Self>> {
        let manager = Arc::new(Self::initialize(config, paths).await?);
        manager.apply_health_check_config(&config.health_check);
        Ok(manager)
    }

    /// Starts the health monitor if `config` enables it. Returns whether a
    /// monitor was started.
    pub fn apply_health_check_config(self: &Arc<Self>, config: &HealthCheckConfig) -> bool {
        if !config.enabled {
            debug!("Periodic health checks disabled");
            return false;
        }
        self.start_health_monitor(Duration::from_secs(config.interval_secs));
        true
    }

    pub fn is_health_monitor_running(&self) -> bool {
        self.health_monitor
            .lock()
            .as_ref()
            .map_or(false, |m| !m.handle.is_finished())
    }

    /// Registers `provider`, replacing any provider with the same name.
    pub fn add_provider(&self, provider: Arc<dyn ModelProvider>) {
        let name = provider.get_provider_name().to_string();
        self.outcomes.status.register(&name);
        if let Some(costs) = &self.outcomes.costs {
            costs.register_pricing(provider.get_models());
        }

        let mut providers = self.providers.write();
        match providers.iter().position(|p| p.get_provider_name() == name) {
            Some(index) => providers[index] = provider,
            None => providers.push(provider),
        }
        debug!(provider = %name, "Provider registered");
    }

    pub fn set_use_case_mapping(&self, use_case: UseCase, mapping: UseCaseModelMapping) {
        self.mappings.write().insert(use_case, mapping);
    }

    pub fn guard(&self) -> &Arc<CallGuard> {
        &self.guard
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.get_provider_name() == name)
            .cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .read()
            .iter()
            .map(|p| p.get_provider_name().to_string())
            .collect()
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.providers
            .read()
            .iter()
            .flat_map(|p| p.get_models().iter().cloned())
            .collect()
    }

    pub async fn complete(&self, options: CompletionOptions) -> Result<CompletionResult> {
        let plan = self.plan(options)?;
        info!(
            request_id = %plan.options.request_id,
            target = %plan.label,
            candidates = plan.candidates.len(),
            "Routing completion"
        );

        let (mut result, candidate, _) = self
            .dispatch_with_fallback(&plan, |provider, options| async move {
                provider.complete(options).await
            })
            .await?;

        result.usage = TokenUsage::new(result.usage.prompt_tokens, result.usage.completion_tokens);
        self.outcomes
            .succeeded(&plan.attempt(&candidate), result.usage, result.latency_ms, result.cached)
            .await;

        info!(
            request_id = %result.request_id,
            provider = %result.provider,
            model = %result.model,
            latency_ms = result.latency_ms,
            tokens = result.usage.total_tokens,
            "Completion succeeded"
        );
        Ok(result)
    }

    /// Fallback applies while the stream is being established. Once a
    /// provider has accepted the request, later failures end the stream.
    pub async fn stream(&self, options: CompletionOptions) -> Result<ChatStream> {
        let plan = self.plan(options)?;
        info!(
            request_id = %plan.options.request_id,
            target = %plan.label,
            candidates = plan.candidates.len(),
            "Routing stream"
        );

        let (inner, candidate, started) = self
            .dispatch_with_fallback(&plan, |provider, options| async move {
                provider.stream(options).await
            })
            .await?;

        let (sender, outer) = ChatStream::channel(&plan.options.request_id, CancellationToken::new());
        tokio::spawn(relay_stream(
            self.outcomes.clone(),
            plan.attempt(&candidate),
            started,
            inner,
            sender,
        ));
        Ok(outer)
    }

    /// Checks every provider concurrently and folds the results into
    /// provider status.
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let providers: Vec<Arc<dyn ModelProvider>> = self.providers.read().clone();
        let checks = providers.iter().map(|provider| async move {
            let name = provider.get_provider_name();
            match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, provider.health_check(None)).await {
                Ok(result) => result,
                Err(_) => HealthCheckResult::unhealthy(
                    name,
                    provider.default_model(),
                    Error::Timeout(HEALTH_CHECK_TIMEOUT).to_string(),
                ),
            }
        });
        let results = join_all(checks).await;

        for result in &results {
            self.outcomes.status.apply_health_check(result);
            if result.healthy {
                debug!(provider = %result.provider, latency_ms = ?result.latency_ms, "Health check passed");
            } else {
                warn!(
                    provider = %result.provider,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Health check failed"
                );
            }
        }
        results
    }

    /// Runs health checks every `interval` until shutdown. Replaces a
    /// monitor that is already running.
    pub fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let shutdown = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let results = manager.run_health_checks().await;
                let healthy = results.iter().filter(|r| r.healthy).count();
                debug!(healthy, total = results.len(), "Periodic health check finished");
            }
            debug!("Health monitor stopped");
        });

        info!(interval_secs = interval.as_secs(), "Health monitor started");
        if let Some(previous) = self
            .health_monitor
            .lock()
            .replace(HealthMonitor { shutdown, handle })
        {
            previous.shutdown.cancel();
        }
    }

    pub fn get_provider_statuses(&self) -> Vec<ProviderStatus> {
        self.outcomes.status.all()
    }

    pub fn get_provider_status(&self, provider: &str) -> Option<ProviderStatus> {
        self.outcomes.status.get(provider)
    }

    pub fn circuit_states(&self) -> Vec<CircuitBreakerStats> {
        self.guard.breakers().snapshot()
    }

    /// Cancels one request across all providers, or everything in flight.
    pub fn cancel(&self, request_id: Option<&str>) -> usize {
        let cancelled: usize = self
            .providers
            .read()
            .iter()
            .map(|p| p.cancel(request_id))
            .sum();
        if cancelled > 0 {
            info!(request_id = request_id.unwrap_or("*"), cancelled, "Cancelled in-flight requests");
        }
        cancelled
    }

    pub fn cost_tracker(&self) -> Option<&Arc<CostTracker>> {
        self.outcomes.costs.as_ref()
    }

    pub async fn cost_summary(&self) -> Option<CostSummary> {
        match &self.outcomes.costs {
            Some(costs) => Some(costs.get_summary().await),
            None => None,
        }
    }

    pub async fn recent_costs(&self, limit: usize) -> Vec<CostRecord> {
        match &self.outcomes.costs {
            Some(costs) => costs.get_recent_records(limit).await,
            None => Vec::new(),
        }
    }

    pub fn query_log(&self) -> Option<&QueryLog> {
        self.outcomes.query_log.as_ref()
    }

    /// Stops the health monitor, cancels in-flight requests, flushes cost
    /// records and closes the query-log database.
    pub async fn shutdown(&self) {
        info!("Shutting down model manager");
        let monitor = self.health_monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.shutdown.cancel();
            if let Err(e) = monitor.handle.await {
                error!("Health monitor task failed: {}", e);
            }
        }

        self.cancel(None);

        if let Some(costs) = &self.outcomes.costs {
            costs.shutdown().await;
        }

        let database = self.database.lock().take();
        if let Some(database) = database {
            database.close().await;
        }
    }

    fn plan(&self, mut options: CompletionOptions) -> Result<RequestPlan> {
        let (candidates, use_case, mapping, label) = match options.model.clone() {
            Some(model) => {
                let candidate = self.resolve_pinned(&model)?;
                let mapping = options
                    .use_case
                    .and_then(|u| self.mappings.read().get(&u).cloned());
                (vec![candidate], options.use_case, mapping, model)
            }
            None => {
                let use_case = options.use_case.unwrap_or(UseCase::Chat);
                let mapping = self
                    .mappings
                    .read()
                    .get(&use_case)
                    .cloned()
                    .ok_or_else(|| Error::NoCandidates(use_case.to_string()))?;
                let candidates = mapping.candidates()?;
                (candidates, Some(use_case), Some(mapping), use_case.to_string())
            }
        };

        if let Some(mapping) = &mapping {
            apply_use_case_defaults(&mut options, mapping);
        }

        Ok(RequestPlan {
            candidates: self.select_candidates(candidates),
            options,
            use_case,
            label,
        })
    }

    /// `provider:model` pins that pair; a bare id pins the first provider
    /// whose catalog has it.
    fn resolve_pinned(&self, model: &str) -> Result<ModelRef> {
        if let Some(model_ref) = ModelRef::parse(model) {
            if self.provider(&model_ref.provider).is_none() {
                return Err(Error::ModelNotFound(model.to_string()));
            }
            return Ok(model_ref);
        }
        self.providers
            .read()
            .iter()
            .find(|p| p.has_model(model))
            .map(|p| ModelRef::new(p.get_provider_name(), model))
            .ok_or_else(|| Error::ModelNotFound(model.to_string()))
    }

    /// Drops candidates on providers past the unhealthy threshold. When none
    /// is healthy every candidate stays, so traffic can still recover them.
    fn select_candidates(&self, candidates: Vec<ModelRef>) -> Vec<ModelRef> {
        let (healthy, unhealthy): (Vec<ModelRef>, Vec<ModelRef>) = candidates
            .into_iter()
            .partition(|c| self.outcomes.status.is_healthy(&c.provider));
        if healthy.is_empty() {
            if !unhealthy.is_empty() {
                debug!("No healthy candidates, trying all");
            }
            return unhealthy;
        }
        if !unhealthy.is_empty() {
            info!(
                skipped = ?unhealthy.iter().map(|c| c.key()).collect::<Vec<_>>(),
                "Skipping candidates on unhealthy providers"
            );
        }
        healthy
    }

    /// Tries candidates strictly in order. Returns the value together with
    /// the candidate that produced it and when that attempt started.
    async fn dispatch_with_fallback<T, F, Fut>(
        &self,
        plan: &RequestPlan,
        mut call: F,
    ) -> Result<(T, ModelRef, Instant)>
    where
        F: FnMut(Arc<dyn ModelProvider>, CompletionOptions) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempted: Vec<String> = Vec::new();
        let mut last_error: Option<Error> = None;

        for (position, candidate) in plan.candidates.iter().enumerate() {
            let Some(provider) = self.provider(&candidate.provider) else {
                debug!(candidate = %candidate, "Skipping candidate, provider not configured");
                continue;
            };
            attempted.push(candidate.key());

            if self.guard.is_open(&candidate.provider, &candidate.model) {
                info!(candidate = %candidate, "Skipping candidate, circuit open");
                last_error = Some(Error::CircuitOpen {
                    key: CircuitBreakerRegistry::key(&candidate.provider, &candidate.model),
                });
                continue;
            }

            let mut options = plan.options.clone();
            options.model = Some(candidate.model.clone());
            let started = Instant::now();

            match call(provider, options).await {
                Ok(value) => return Ok((value, candidate.clone(), started)),
                Err(error) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.outcomes
                        .failed(&plan.attempt(candidate), &error, latency_ms)
                        .await;

                    if matches!(error, Error::Cancelled(_) | Error::Authentication { .. }) {
                        warn!(candidate = %candidate, error = %error, "Request stopped without fallback");
                        return Err(error);
                    }

                    match plan.candidates.get(position + 1) {
                        Some(next) => warn!(
                            from = %candidate,
                            to = %next,
                            error = %error,
                            "Falling back to next candidate"
                        ),
                        None => warn!(from = %candidate, error = %error, "Last candidate failed"),
                    }
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(source) => {
                error!(target = %plan.label, attempted = ?attempted, "All candidates exhausted");
                Err(Error::AllCandidatesExhausted {
                    attempted,
                    source: Box::new(source),
                })
            }
            None => Err(Error::NoCandidates(plan.label.clone())),
        }
    }
}

fn build_provider(
    name: &str,
    config: &ProviderConfig,
    timeout: Duration,
    guard: Arc<CallGuard>,
) -> Result<Arc<dyn ModelProvider>> {
    let provider: Arc<dyn ModelProvider> = match config.kind_for(name) {
        Some(ProviderKind::OpenAi) => Arc::new(OpenAIProvider::from_config(name, config, timeout, guard)?),
        Some(ProviderKind::Anthropic) => {
            Arc::new(AnthropicProvider::from_config(name, config, timeout, guard)?)
        }
        Some(ProviderKind::Gemini) => Arc::new(GeminiProvider::from_config(name, config, timeout, guard)?),
        None => {
            return Err(Error::validation(format!(
                "Provider {} has no kind configured",
                name
            )))
        }
    };
    Ok(provider)
}

/// Mapping defaults fill what the request leaves out. The system prompt is
/// only added when the conversation has none.
fn apply_use_case_defaults(options: &mut CompletionOptions, mapping: &UseCaseModelMapping) {
    if options.temperature.is_none() {
        options.temperature = mapping.temperature;
    }
    if options.max_tokens.is_none() {
        options.max_tokens = mapping.max_tokens;
    }
    if let Some(system_prompt) = &mapping.system_prompt {
        if !options.has_system_message() {
            options
                .messages
                .insert(0, Message::system(system_prompt.clone()));
        }
    }
}

/// Forwards chunks from the provider stream to the caller and records the
/// outcome when the terminal chunk or an error arrives. Usage missing from
/// the terminal chunk is estimated from the text.
async fn relay_stream(
    outcomes: Outcomes,
    attempt: Attempt,
    started: Instant,
    mut inner: ChatStream,
    mut sender: StreamSender,
) {
    let mut text = String::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = sender.cancelled() => None,
            next = inner.next_chunk() => Some(next),
        };
        let Some(next) = next else {
            debug!(request_id = %attempt.request_id, "Caller closed the stream");
            inner.cancel();
            return;
        };

        match next {
            Ok(Some(mut chunk)) => {
                text.push_str(&chunk.delta);
                if chunk.is_last {
                    let usage = chunk
                        .usage
                        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
                        .unwrap_or_else(|| {
                            TokenUsage::new(attempt.prompt_tokens, estimate_text_tokens(&text))
                        });
                    chunk.usage = Some(usage);
                    let latency_ms = started.elapsed().as_millis() as u64;
                    outcomes.succeeded(&attempt, usage, latency_ms, false).await;
                    info!(
                        request_id = %attempt.request_id,
                        provider = %attempt.provider,
                        model = %attempt.model,
                        latency_ms,
                        tokens = usage.total_tokens,
                        "Stream completed"
                    );
                    sender.forward(chunk).await;
                    return;
                }
                if !sender.forward(chunk).await {
                    inner.cancel();
                    return;
                }
            }
            Ok(None) => return,
            Err(error) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                warn!(
                    request_id = %attempt.request_id,
                    provider = %attempt.provider,
                    error = %error,
                    "Stream failed"
                );
                outcomes.failed(&attempt, &error, latency_ms).await;
                sender.fail(error).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::models::mock::{ScriptStep, ScriptedProvider};
    use crate::models::retry::RetryPolicy;
    use crate::storage::{Database, MemoryCostStore};
    use tempfile::TempDir;

    struct Fixture {
        manager: Arc<ModelManager>,
        a: Arc<ScriptedProvider>,
        b: Arc<ScriptedProvider>,
        store: Arc<MemoryCostStore>,
    }

    fn fixture(
        guard: CallGuard,
        unhealthy_threshold: u32,
        script_a: Vec<ScriptStep>,
        script_b: Vec<ScriptStep>,
    ) -> Fixture {
        let guard = guard.shared();
        let a = Arc::new(ScriptedProvider::new("a", &["m1"], guard.clone()).with_script(script_a));
        let b = Arc::new(ScriptedProvider::new("b", &["m2"], guard.clone()).with_script(script_b));
        let store = Arc::new(MemoryCostStore::new());
        let tracker = Arc::new(CostTracker::new(
            store.clone(),
            100,
            Duration::from_secs(1),
        ));

        let manager = ModelManager::builder(guard)
            .unhealthy_threshold(unhealthy_threshold)
            .use_cases([(UseCase::Chat, UseCaseModelMapping::new("a:m1", &["b:m2"]))])
            .provider(a.clone())
            .provider(b.clone())
            .cost_tracker(tracker)
            .build();

        Fixture {
            manager: Arc::new(manager),
            a,
            b,
            store,
        }
    }

    fn no_retry_guard(failure_threshold: u32) -> CallGuard {
        CallGuard::new(
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::from_secs(30),
            },
            RetryPolicy::no_retries(),
        )
    }

    /// Fields of every event seen while installed as the thread default.
    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<Mutex<Vec<Vec<(String, String)>>>>);

    impl CapturedEvents {
        fn with_message(&self, message: &str) -> Option<Vec<(String, String)>> {
            self.0
                .lock()
                .iter()
                .find(|fields| fields.iter().any(|(k, v)| k == "message" && v == message))
                .cloned()
        }
    }

    struct CaptureLayer(CapturedEvents);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CaptureLayer {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            let mut visitor = FieldVisitor::default();
            event.record(&mut visitor);
            self.0 .0.lock().push(visitor.0);
        }
    }

    #[derive(Default)]
    struct FieldVisitor(Vec<(String, String)>);

    impl tracing::field::Visit for FieldVisitor {
        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.0.push((field.name().to_string(), value.to_string()));
        }

        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn chat(text: &str) -> CompletionOptions {
        CompletionOptions::new(vec![Message::user(text)]).with_use_case(UseCase::Chat)
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_after_retry_budget_is_exhausted() {
        let f = fixture(
            CallGuard::new(CircuitBreakerConfig::default(), RetryPolicy::default()),
            3,
            vec![ScriptStep::FailStatus(503); 4],
            vec![],
        );

        let result = f.manager.complete(chat("hello there")).await.unwrap();

        assert_eq!(result.provider, "b");
        assert_eq!(result.model, "m2");
        assert_eq!(
            result.usage.total_tokens,
            result.usage.prompt_tokens + result.usage.completion_tokens
        );
        assert_eq!(f.a.attempts(), 4);
        assert_eq!(f.b.attempts(), 1);

        let records = f.manager.recent_costs(10).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider, "b");
        assert_eq!(records[0].total_tokens, result.usage.total_tokens);
        assert_eq!(records[0].use_case.as_deref(), Some("chat"));

        let a_status = f.manager.get_provider_status("a").unwrap();
        assert_eq!(a_status.consecutive_failures, 1);
        assert!(a_status.healthy);
    }

    #[tokio::test]
    async fn test_fallback_event_names_both_candidates() {
        use tracing_subscriber::layer::SubscriberExt;

        let events = CapturedEvents::default();
        let _default = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(CaptureLayer(events.clone())),
        );
        let f = fixture(no_retry_guard(5), 3, vec![ScriptStep::FailStatus(503)], vec![]);

        let result = f.manager.complete(chat("hello")).await.unwrap();
        assert_eq!(result.provider, "b");

        let fallback = events
            .with_message("Falling back to next candidate")
            .expect("fallback event was not emitted");
        assert_eq!(field(&fallback, "from"), Some("a:m1"));
        assert_eq!(field(&fallback, "to"), Some("b:m2"));
        assert!(field(&fallback, "error").map_or(false, |e| e.contains("503")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_skipped_until_recovery() {
        let f = fixture(
            no_retry_guard(1),
            5,
            vec![ScriptStep::FailStatus(500)],
            vec![],
        );

        assert_eq!(f.manager.complete(chat("one")).await.unwrap().provider, "b");
        assert!(f.manager.guard().is_open("a", "m1"));

        assert_eq!(f.manager.complete(chat("two")).await.unwrap().provider, "b");
        assert_eq!(f.a.attempts(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;

        let recovered = f.manager.complete(chat("three")).await.unwrap();
        assert_eq!(recovered.provider, "a");
        assert!(!f.manager.guard().is_open("a", "m1"));
        assert_eq!(
            f.manager.guard().breakers().get("a", "m1").get_state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_unhealthy_provider_is_skipped() {
        let f = fixture(
            no_retry_guard(10),
            1,
            vec![ScriptStep::FailStatus(500)],
            vec![ScriptStep::Reply("b1".to_string()), ScriptStep::FailStatus(500)],
        );

        assert_eq!(f.manager.complete(chat("one")).await.unwrap().content, "b1");
        assert!(!f.manager.get_provider_status("a").unwrap().healthy);

        match f.manager.complete(chat("two")).await {
            Err(Error::AllCandidatesExhausted { attempted, .. }) => {
                assert_eq!(attempted, vec!["b:m2"]);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.provider)),
        }
        assert_eq!(f.a.attempts(), 1);

        // Both unhealthy now: every candidate is tried again in order.
        let result = f.manager.complete(chat("three")).await.unwrap();
        assert_eq!(result.provider, "a");
        assert_eq!(f.a.attempts(), 2);
        assert_eq!(f.b.attempts(), 2);
        assert!(f.manager.get_provider_status("a").unwrap().healthy);
    }

    #[tokio::test]
    async fn test_pinned_models() {
        let f = fixture(no_retry_guard(5), 3, vec![], vec![]);

        let pinned = f
            .manager
            .complete(chat("x").with_model("b:m2"))
            .await
            .unwrap();
        assert_eq!(pinned.provider, "b");
        assert_eq!(f.a.attempts(), 0);

        let short = f.manager.complete(chat("x").with_model("m1")).await.unwrap();
        assert_eq!(short.provider, "a");

        assert!(matches!(
            f.manager.complete(chat("x").with_model("nope")).await,
            Err(Error::ModelNotFound(_))
        ));
        assert!(matches!(
            f.manager.complete(chat("x").with_model("zz:m1")).await,
            Err(Error::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pinned_model_has_no_fallback() {
        let f = fixture(no_retry_guard(5), 3, vec![ScriptStep::FailStatus(400)], vec![]);
        let err = f
            .manager
            .complete(chat("x").with_model("a:m1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::Provider { status: Some(400), .. }
        ));
        assert_eq!(f.b.attempts(), 0);
    }

    #[tokio::test]
    async fn test_authentication_error_is_surfaced_immediately() {
        let f = fixture(no_retry_guard(5), 3, vec![ScriptStep::FailAuth], vec![]);
        let err = f.manager.complete(chat("x")).await.unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
        assert_eq!(f.a.attempts(), 1);
        assert_eq!(f.b.attempts(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let f = fixture(
            no_retry_guard(5),
            3,
            vec![ScriptStep::FailStatus(400)],
            vec![ScriptStep::FailStatus(422)],
        );
        match f.manager.complete(chat("x")).await {
            Err(Error::AllCandidatesExhausted { attempted, source }) => {
                assert_eq!(attempted, vec!["a:m1", "b:m2"]);
                assert!(matches!(*source, Error::Provider { status: Some(422), .. }));
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.provider)),
        }
        assert!(f.store.snapshot().is_empty());
        assert!(f.manager.recent_costs(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_use_case_defaults_fill_gaps() {
        let f = fixture(no_retry_guard(5), 3, vec![], vec![]);
        let mut mapping = UseCaseModelMapping::new("a:m1", &[])
            .with_temperature(0.2)
            .with_max_tokens(64);
        mapping.system_prompt = Some("Be brief.".to_string());
        f.manager.set_use_case_mapping(UseCase::Summarization, mapping);

        let options = CompletionOptions::new(vec![Message::user("summarize")])
            .with_use_case(UseCase::Summarization)
            .with_temperature(0.9);
        f.manager.complete(options).await.unwrap();

        let sent = f.a.last_request().unwrap();
        assert_eq!(sent.temperature, Some(0.9));
        assert_eq!(sent.max_tokens, Some(64));
        assert_eq!(sent.messages.len(), 2);
        assert_eq!(sent.messages[0].content, "Be brief.");

        let with_system = CompletionOptions::new(vec![
            Message::system("Custom."),
            Message::user("summarize"),
        ])
        .with_use_case(UseCase::Summarization);
        f.manager.complete(with_system).await.unwrap();
        let sent = f.a.last_request().unwrap();
        assert_eq!(sent.messages.len(), 2);
        assert_eq!(sent.messages[0].content, "Custom.");
    }

    #[tokio::test]
    async fn test_stream_falls_back_and_records_cost() {
        let f = fixture(
            no_retry_guard(5),
            3,
            vec![ScriptStep::FailStatus(400)],
            vec![ScriptStep::Reply("streamed reply text".to_string())],
        );

        let stream = f.manager.stream(chat("go")).await.unwrap();
        let summary = stream.collect().await.unwrap();
        assert_eq!(summary.content, "streamed reply text");
        let usage = summary.usage.unwrap();
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);

        let records = f.manager.recent_costs(10).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider, "b");
        assert_eq!(records[0].total_tokens, usage.total_tokens);
    }

    #[tokio::test]
    async fn test_stream_matches_complete_content() {
        let f = fixture(
            no_retry_guard(5),
            3,
            vec![
                ScriptStep::Reply("same words either way".to_string()),
                ScriptStep::Reply("same words either way".to_string()),
            ],
            vec![],
        );
        let complete = f.manager.complete(chat("q")).await.unwrap();
        let streamed = f.manager.stream(chat("q")).await.unwrap().collect().await.unwrap();
        assert_eq!(streamed.content, complete.content);
    }

    #[tokio::test]
    async fn test_cancel_stops_fallback() {
        let f = fixture(no_retry_guard(5), 3, vec![ScriptStep::Hang], vec![]);
        let options = chat("wait").with_request_id("req-1");

        let task = {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.complete(options).await })
        };
        while f.a.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.manager.cancel(Some("req-1")), 1);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(id)) if id == "req-1"));
        assert_eq!(f.b.attempts(), 0);
        assert_eq!(f.manager.get_provider_status("a").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_health_checks_update_status() {
        let f = fixture(no_retry_guard(5), 3, vec![], vec![]);
        f.b.set_healthy(false);

        let results = f.manager.run_health_checks().await;
        assert_eq!(results.len(), 2);

        let statuses = f.manager.get_provider_statuses();
        assert_eq!(statuses.len(), 2);
        let a = &statuses[0];
        let b = &statuses[1];
        assert!(a.healthy && a.last_check.is_some());
        assert_eq!(b.consecutive_failures, 1);
        assert_eq!(b.last_error.as_deref(), Some("scripted health failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_runs_until_shutdown() {
        let f = fixture(no_retry_guard(5), 3, vec![], vec![]);
        f.b.set_healthy(false);
        f.manager.start_health_monitor(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(f.manager.get_provider_status("b").unwrap().consecutive_failures, 2);

        f.manager.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.manager.get_provider_status("b").unwrap().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_config_controls_monitor() {
        let enabled = fixture(no_retry_guard(5), 3, vec![], vec![]);
        enabled.b.set_healthy(false);
        let started = enabled.manager.apply_health_check_config(&HealthCheckConfig {
            enabled: true,
            interval_secs: 10,
        });
        assert!(started);
        assert!(enabled.manager.is_health_monitor_running());

        let disabled = fixture(no_retry_guard(5), 3, vec![], vec![]);
        disabled.b.set_healthy(false);
        let started = disabled.manager.apply_health_check_config(&HealthCheckConfig {
            enabled: false,
            interval_secs: 10,
        });
        assert!(!started);
        assert!(!disabled.manager.is_health_monitor_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(enabled.manager.get_provider_status("b").unwrap().consecutive_failures, 3);
        assert_eq!(disabled.manager.get_provider_status("b").unwrap().consecutive_failures, 0);

        enabled.manager.shutdown().await;
        assert!(!enabled.manager.is_health_monitor_running());
    }

    #[tokio::test]
    async fn test_start_honours_health_check_flag() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(dir.path());
        let mut config = OrchestratorConfig::default();
        config.query_log.enabled = false;

        let manager = ModelManager::start(&config, &paths).await.unwrap();
        assert!(manager.is_health_monitor_running());
        manager.shutdown().await;

        config.health_check.enabled = false;
        let manager = ModelManager::start(&config, &paths).await.unwrap();
        assert!(!manager.is_health_monitor_running());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_log_records_each_attempt() {
        let guard = no_retry_guard(5).shared();
        let a = Arc::new(
            ScriptedProvider::new("a", &["m1"], guard.clone())
                .with_script([ScriptStep::FailStatus(500)]),
        );
        let b = Arc::new(ScriptedProvider::new("b", &["m2"], guard.clone()));
        let database = Database::in_memory().await.unwrap();
        let manager = ModelManager::builder(guard)
            .use_cases([(UseCase::Chat, UseCaseModelMapping::new("a:m1", &["b:m2"]))])
            .provider(a)
            .provider(b)
            .query_log(QueryLog::new(database.pool().clone(), 100))
            .build();

        manager.complete(chat("log me")).await.unwrap();

        let stats = manager.query_log().unwrap().stats().await.unwrap();
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.successful_queries, 1);
        let recent = manager.query_log().unwrap().recent(10).await.unwrap();
        assert!(recent.iter().all(|e| e.prompt_prefix == "log me"));
        assert!(manager.cost_summary().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_without_credentials() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(dir.path());
        let config = OrchestratorConfig::default();

        let manager = ModelManager::initialize(&config, &paths).await.unwrap();
        assert!(manager.provider_names().is_empty());
        assert!(manager.cost_tracker().is_some());
        assert!(manager.query_log().is_some());
        assert!(matches!(
            manager.complete(chat("x")).await,
            Err(Error::NoCandidates(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_builds_configured_providers() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(dir.path());
        let mut config = OrchestratorConfig::default();
        config
            .apply_env_overrides(|key| (key == "OPENAI_API_KEY").then(|| "sk-test".to_string()))
            .unwrap();
        // Enabled without a key: construction fails and the provider is skipped.
        config.providers.get_mut("anthropic").unwrap().enabled = true;
        config.query_log.enabled = false;

        let manager = ModelManager::initialize(&config, &paths).await.unwrap();
        assert_eq!(manager.provider_names(), vec!["openai"]);
        assert!(manager.list_models().iter().any(|m| m.id == "gpt-4o-mini"));
        assert!(manager.query_log().is_none());
        manager.shutdown().await;
    }
}
