pub mod provider;
pub mod streaming;
pub mod http;
pub mod rate_limiter;
pub mod circuit_breaker;
pub mod retry;
pub mod guard;
pub mod use_case;
pub mod status;
pub mod openai;
pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod manager;

pub use provider::{
    CompletionOptions, CompletionResult, FinishReason, HealthCheckResult, Message, MessageRole,
    ModelInfo, ModelProvider, PricingInfo, StreamChunk, TokenUsage, ToolCall, ToolDefinition,
};
pub use streaming::{ChatStream, StreamSummary};
pub use rate_limiter::{RateLimitState, RateLimitThresholds, RateLimiter};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::RetryPolicy;
pub use guard::CallGuard;
pub use use_case::{ModelRef, UseCase, UseCaseModelMapping};
pub use status::ProviderStatus;
pub use openai::OpenAIProvider;
pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use manager::{ModelManager, ModelManagerBuilder};
