use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::models::streaming::ChatStream;
use crate::models::use_case::UseCase;

/// Uniform contract every vendor adapter implements. The manager holds these
/// as trait objects keyed by provider name.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn get_provider_name(&self) -> &str;

    fn default_model(&self) -> &str;

    fn get_models(&self) -> &[ModelInfo];

    fn get_model(&self, id: &str) -> Option<&ModelInfo> {
        self.get_models().iter().find(|m| m.id == id)
    }

    fn has_model(&self, id: &str) -> bool {
        self.get_model(id).is_some()
    }

    async fn complete(&self, options: CompletionOptions) -> Result<CompletionResult>;

    async fn stream(&self, options: CompletionOptions) -> Result<ChatStream>;

    /// Minimal real completion against `model` (or the default model).
    async fn health_check(&self, model: Option<&str>) -> HealthCheckResult;

    /// Cancels one in-flight request, or all of them when `request_id` is
    /// `None`. Returns the number of requests signalled.
    fn cancel(&self, request_id: Option<&str>) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub request_id: String,
    pub messages: Vec<Message>,
    /// Either a short model id or a fully-qualified `provider:model`.
    pub model: Option<String>,
    pub use_case: Option<UseCase>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub user_id: Option<String>,
}

impl CompletionOptions {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            messages,
            model: None,
            use_case: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
            tools: Vec::new(),
            tool_choice: None,
            user_id: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_use_case(mut self, use_case: UseCase) -> Self {
        self.use_case = Some(use_case);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>, tool_choice: ToolChoice) -> Self {
        self.tools = tools;
        self.tool_choice = Some(tool_choice);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn has_system_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == MessageRole::System)
    }

    /// The last user message, used for query-log prompt prefixes.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }

    /// Coarse budget reservation for the rate limiter: prompt estimate plus
    /// the requested completion ceiling.
    pub fn estimated_tokens(&self, default_max_tokens: u32) -> u32 {
        estimate_prompt_tokens(&self.messages).saturating_add(self.max_tokens.unwrap_or(default_max_tokens))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(MessageRole::Assistant, "")
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    /// Force a specific tool by name.
    Tool(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_delta: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub id: String,
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub latency_ms: u64,
    #[serde(default)]
    pub cached: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub request_id: String,
    pub index: u32,
    pub delta: String,
    pub tool_call_delta: Option<ToolCallDelta>,
    pub is_first: bool,
    pub is_last: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Basic,
    Standard,
    Premium,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTier {
    Slow,
    Medium,
    Fast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub chat: bool,
    pub vision: bool,
    pub function_calling: bool,
    pub streaming: bool,
}

impl ModelCapabilities {
    pub fn full() -> Self {
        Self {
            chat: true,
            vision: true,
            function_calling: true,
            streaming: true,
        }
    }

    pub fn text_only() -> Self {
        Self {
            vision: false,
            ..Self::full()
        }
    }
}

/// Static metadata about one model a provider offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub capabilities: ModelCapabilities,
    pub input_price_per_1k_tokens: Decimal,
    pub output_price_per_1k_tokens: Decimal,
    pub quality: QualityTier,
    pub speed: SpeedTier,
}

impl ModelInfo {
    /// Catalog entry with full capabilities; prices are per 1000 tokens.
    #[allow(clippy::too_many_arguments)]
    pub fn priced(
        provider: &str,
        id: &str,
        name: &str,
        context_window: u32,
        max_output_tokens: u32,
        input_price_per_1k_tokens: Decimal,
        output_price_per_1k_tokens: Decimal,
        quality: QualityTier,
        speed: SpeedTier,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider: provider.to_string(),
            context_window,
            max_output_tokens,
            capabilities: ModelCapabilities::full(),
            input_price_per_1k_tokens,
            output_price_per_1k_tokens,
            quality,
            speed,
        }
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn pricing(&self) -> PricingInfo {
        PricingInfo {
            input_price_per_1k_tokens: self.input_price_per_1k_tokens,
            output_price_per_1k_tokens: self.output_price_per_1k_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricingInfo {
    pub input_price_per_1k_tokens: Decimal,
    pub output_price_per_1k_tokens: Decimal,
}

impl PricingInfo {
    pub fn free() -> Self {
        Self {
            input_price_per_1k_tokens: Decimal::ZERO,
            output_price_per_1k_tokens: Decimal::ZERO,
        }
    }

    /// Returns `(input_cost, output_cost)`.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> (Decimal, Decimal) {
        let thousand = Decimal::from(1000);
        let input_cost = Decimal::from(input_tokens) * self.input_price_per_1k_tokens / thousand;
        let output_cost = Decimal::from(output_tokens) * self.output_price_per_1k_tokens / thousand;
        (input_cost, output_cost)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub provider: String,
    pub model: String,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn healthy(provider: impl Into<String>, model: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(
        provider: impl Into<String>,
        model: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Registry of cancellation tokens for requests a provider is serving.
#[derive(Debug, Clone, Default)]
pub struct InFlightRequests {
    tokens: Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>,
    generation: Arc<AtomicU64>,
}

impl InFlightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `request_id`; the entry is removed when the guard drops.
    pub fn register(&self, request_id: &str) -> InFlightGuard {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.tokens
            .lock()
            .insert(request_id.to_string(), (generation, token.clone()));
        InFlightGuard {
            tokens: self.tokens.clone(),
            request_id: request_id.to_string(),
            generation,
            token,
        }
    }

    pub fn cancel(&self, request_id: Option<&str>) -> usize {
        let tokens = self.tokens.lock();
        match request_id {
            Some(id) => match tokens.get(id) {
                Some((_, token)) => {
                    token.cancel();
                    1
                }
                None => 0,
            },
            None => {
                for (_, token) in tokens.values() {
                    token.cancel();
                }
                tokens.len()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InFlightGuard {
    tokens: Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>,
    request_id: String,
    generation: u64,
    token: CancellationToken,
}

impl InFlightGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut tokens = self.tokens.lock();
        // A newer registration under the same id must survive.
        if tokens
            .get(&self.request_id)
            .map_or(false, |(generation, _)| *generation == self.generation)
        {
            tokens.remove(&self.request_id);
        }
    }
}

/// The vendor model id to send: the requested model with any
/// `provider:` prefix removed, or `default_model`.
pub fn resolve_model_id(requested: Option<&str>, provider: &str, default_model: &str) -> String {
    match requested {
        Some(model) => match model.split_once(':') {
            Some((prefix, id)) if prefix == provider => id.to_string(),
            _ => model.to_string(),
        },
        None => default_model.to_string(),
    }
}

/// Roughly four characters per token, the usual heuristic for English text.
pub fn estimate_text_tokens(text: &str) -> u32 {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    chars.saturating_add(3) / 4
}

pub fn estimate_prompt_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_text_tokens(&m.content).saturating_add(4))
        .fold(0u32, u32::saturating_add)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_saturates() {
        let usage = TokenUsage::new(u32::MAX, 10);
        assert_eq!(usage.total_tokens, u32::MAX);
        assert_eq!(TokenUsage::new(3, 4).total_tokens, 7);

        let options = CompletionOptions::new(vec![Message::user("hi")]).with_max_tokens(u32::MAX);
        assert_eq!(options.estimated_tokens(256), u32::MAX);
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn test_pricing_calculation() {
        let pricing = PricingInfo {
            input_price_per_1k_tokens: Decimal::new(3, 3),
            output_price_per_1k_tokens: Decimal::new(15, 3),
        };
        let (input, output) = pricing.calculate_cost(2000, 1000);
        assert_eq!(input, Decimal::new(6, 3));
        assert_eq!(output, Decimal::new(15, 3));
    }

    #[test]
    fn test_options_builder() {
        let options = CompletionOptions::new(vec![
            Message::system("be brief"),
            Message::user("hello there"),
        ])
        .with_model("openai:gpt-4o")
        .with_max_tokens(100);

        assert!(options.has_system_message());
        assert_eq!(options.last_user_message(), Some("hello there"));
        assert_eq!(options.model.as_deref(), Some("openai:gpt-4o"));
        assert!(options.estimated_tokens(512) > 100);
        assert!(!options.request_id.is_empty());
    }

    #[test]
    fn test_in_flight_cancel() {
        let in_flight = InFlightRequests::new();
        let first = in_flight.register("req-1");
        let second = in_flight.register("req-2");
        assert_eq!(in_flight.len(), 2);

        assert_eq!(in_flight.cancel(Some("req-1")), 1);
        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());

        assert_eq!(in_flight.cancel(Some("missing")), 0);
        assert_eq!(in_flight.cancel(None), 2);
        assert!(second.token().is_cancelled());

        drop(first);
        drop(second);
        assert!(in_flight.is_empty());
    }

    #[test]
    fn test_resolve_model_id() {
        assert_eq!(resolve_model_id(None, "openai", "gpt-4o"), "gpt-4o");
        assert_eq!(resolve_model_id(Some("openai:gpt-4o-mini"), "openai", "gpt-4o"), "gpt-4o-mini");
        assert_eq!(resolve_model_id(Some("gpt-4-turbo"), "openai", "gpt-4o"), "gpt-4-turbo");
    }

    #[test]
    fn test_tool_message() {
        let message = Message::tool("call_1", "{\"ok\":true}");
        assert_eq!(message.role, MessageRole::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
    }
}
