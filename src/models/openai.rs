use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::guard::CallGuard;
use crate::models::http;
use crate::models::provider::{
    resolve_model_id, CompletionOptions, CompletionResult, FinishReason, HealthCheckResult,
    InFlightRequests, Message, MessageRole, ModelCapabilities, ModelInfo, ModelProvider,
    QualityTier, SpeedTier, TokenUsage, ToolCall, ToolCallDelta, ToolChoice, ToolDefinition,
};
use crate::models::streaming::{pump_sse, ChatStream, SseFrame, StreamEvent};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Chat-completions adapter. Also serves any OpenAI-compatible gateway
/// through a base URL override.
pub struct OpenAIProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    models: Vec<ModelInfo>,
    guard: Arc<CallGuard>,
    in_flight: InFlightRequests,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>, guard: Arc<CallGuard>) -> Result<Self> {
        Ok(Self {
            name: "openai".to_string(),
            client: http::build_client(Duration::from_secs(60))?,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            models: Self::catalog("openai"),
            guard,
            in_flight: InFlightRequests::new(),
        })
    }

    pub fn from_config(
        name: &str,
        config: &ProviderConfig,
        timeout: Duration,
        guard: Arc<CallGuard>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            client: http::build_client(timeout)?,
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            models: Self::catalog(name),
            guard,
            in_flight: InFlightRequests::new(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn catalog(provider: &str) -> Vec<ModelInfo> {
        vec![
            ModelInfo::priced(
                provider,
                "gpt-4o",
                "GPT-4o",
                128_000,
                16_384,
                Decimal::new(25, 4),
                Decimal::new(1, 2),
                QualityTier::Premium,
                SpeedTier::Medium,
            ),
            ModelInfo::priced(
                provider,
                "gpt-4o-mini",
                "GPT-4o mini",
                128_000,
                16_384,
                Decimal::new(15, 5),
                Decimal::new(6, 4),
                QualityTier::Standard,
                SpeedTier::Fast,
            ),
            ModelInfo::priced(
                provider,
                "gpt-4-turbo",
                "GPT-4 Turbo",
                128_000,
                4_096,
                Decimal::new(1, 2),
                Decimal::new(3, 2),
                QualityTier::Premium,
                SpeedTier::Slow,
            ),
            ModelInfo::priced(
                provider,
                "gpt-3.5-turbo",
                "GPT-3.5 Turbo",
                16_385,
                4_096,
                Decimal::new(5, 4),
                Decimal::new(15, 4),
                QualityTier::Basic,
                SpeedTier::Fast,
            )
            .with_capabilities(ModelCapabilities::text_only()),
        ]
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if !self.api_key.is_empty() {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| Error::authentication(&self.name, format!("Invalid API key format: {}", e)))?;
            headers.insert(AUTHORIZATION, auth_value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OpenAIMessage> {
        messages
            .iter()
            .map(|msg| OpenAIMessage {
                role: match msg.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::System => "system",
                    MessageRole::Tool => "tool",
                }
                .to_string(),
                content: if msg.content.is_empty() && !msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(msg.content.clone())
                },
                name: msg.name.clone(),
                tool_call_id: msg.tool_call_id.clone(),
                tool_calls: msg
                    .tool_calls
                    .iter()
                    .map(|call| OpenAIToolCall {
                        id: call.id.clone(),
                        kind: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            })
            .collect()
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect()
    }

    fn convert_tool_choice(choice: &ToolChoice) -> serde_json::Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool(name) => json!({ "type": "function", "function": { "name": name } }),
        }
    }

    fn build_request(&self, options: &CompletionOptions, model: &str, stream: bool) -> OpenAIRequest {
        OpenAIRequest {
            model: model.to_string(),
            messages: self.convert_messages(&options.messages),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: options.stop.clone(),
            tools: Self::convert_tools(&options.tools),
            tool_choice: if options.tools.is_empty() {
                None
            } else {
                options.tool_choice.as_ref().map(Self::convert_tool_choice)
            },
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
            user: options.user_id.clone(),
        }
    }

    async fn post(&self, body: &OpenAIRequest, cancel: &CancellationToken, request_id: &str) -> Result<Response> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request = self.client.post(&url).headers(self.create_headers()?).json(body);
        http::send(&self.name, request, cancel, request_id).await
    }

    async fn make_request(
        &self,
        body: &OpenAIRequest,
        cancel: &CancellationToken,
        request_id: &str,
    ) -> Result<OpenAIResponse> {
        debug!(
            "Sending request to {}: model={}, messages={}",
            self.name,
            body.model,
            body.messages.len()
        );
        let response = self.post(body, cancel, request_id).await?;
        http::read_json(&self.name, response, cancel, request_id).await
    }

    fn map_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("length") => FinishReason::Length,
            Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    fn build_result(
        &self,
        response: OpenAIResponse,
        request_id: &str,
        requested_model: &str,
        latency_ms: u64,
    ) -> Result<CompletionResult> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider(&self.name, "No choices in response"))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(CompletionResult {
            id: response.id,
            request_id: request_id.to_string(),
            provider: self.name.clone(),
            model: if response.model.is_empty() {
                requested_model.to_string()
            } else {
                response.model
            },
            content: choice.message.content.unwrap_or_default(),
            finish_reason: Self::map_finish_reason(choice.finish_reason.as_deref()),
            usage,
            tool_calls,
            latency_ms,
            cached: false,
            created_at: Utc::now(),
        })
    }

    pub fn parse_stream_frame(frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        let data = frame.data.trim();
        if data == "[DONE]" {
            return Ok(vec![StreamEvent::Done]);
        }

        let chunk: OpenAIStreamResponse = serde_json::from_str(data)?;
        if let Some(error) = chunk.error {
            return Ok(vec![StreamEvent::Error(error.message)]);
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                events.push(StreamEvent::Text(content));
            }
            for call in choice.delta.tool_calls {
                events.push(StreamEvent::ToolCall(ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name: call.function.as_ref().and_then(|f| f.name.clone()),
                    arguments_delta: call
                        .function
                        .and_then(|f| f.arguments)
                        .unwrap_or_default(),
                }));
            }
            if let Some(reason) = choice.finish_reason {
                events.push(StreamEvent::Finish(Self::map_finish_reason(Some(&reason))));
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Usage {
                prompt_tokens: Some(usage.prompt_tokens),
                completion_tokens: Some(usage.completion_tokens),
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
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
        let model = resolve_model_id(options.model.as_deref(), &self.name, &self.default_model);
        let request = self.in_flight.register(&options.request_id);
        let body = self.build_request(&options, &model, false);
        let estimated = options.estimated_tokens(DEFAULT_MAX_TOKENS);

        let start_time = Instant::now();
        let response = self
            .guard
            .execute(&self.name, &model, estimated, &request, |_| {
                self.make_request(&body, request.token(), &options.request_id)
            })
            .await?;
        let latency_ms = start_time.elapsed().as_millis() as u64;

        let result = self.build_result(response, &options.request_id, &model, latency_ms)?;
        self.guard.record_token_usage(&self.name, result.usage.total_tokens);
        debug!(
            "{} completion finished in {}ms ({} tokens)",
            self.name, latency_ms, result.usage.total_tokens
        );
        Ok(result)
    }

    async fn stream(&self, options: CompletionOptions) -> Result<ChatStream> {
        let model = resolve_model_id(options.model.as_deref(), &self.name, &self.default_model);
        let request = self.in_flight.register(&options.request_id);
        let body = self.build_request(&options, &model, true);
        let estimated = options.estimated_tokens(DEFAULT_MAX_TOKENS);

        debug!("Starting streaming request to {}: model={}", self.name, model);
        let response = self
            .guard
            .execute(&self.name, &model, estimated, &request, |_| {
                self.post(&body, request.token(), &options.request_id)
            })
            .await?;

        let (sender, stream) = ChatStream::channel(&options.request_id, request.token().clone());
        let provider = self.name.clone();
        let guard = self.guard.clone();
        tokio::spawn(async move {
            let _request = request;
            if let Some(usage) = pump_sse(&provider, response, sender, Self::parse_stream_frame).await {
                guard.record_token_usage(&provider, usage.total_tokens);
            }
        });
        Ok(stream)
    }

    async fn health_check(&self, model: Option<&str>) -> HealthCheckResult {
        let model = resolve_model_id(model, &self.name, &self.default_model);
        let options = CompletionOptions::new(vec![Message::user("ping")]).with_max_tokens(1);
        let body = self.build_request(&options, &model, false);
        let cancel = CancellationToken::new();

        let start_time = Instant::now();
        match self.make_request(&body, &cancel, &options.request_id).await {
            Ok(_) => {
                let latency_ms = start_time.elapsed().as_millis() as u64;
                info!("{} health check passed for {} in {}ms", self.name, model, latency_ms);
                HealthCheckResult::healthy(&self.name, &model, latency_ms)
            }
            Err(e) => HealthCheckResult::unhealthy(&self.name, &model, e.to_string()),
        }
    }

    fn cancel(&self, request_id: Option<&str>) -> usize {
        self.in_flight.cancel(request_id)
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OpenAIFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    usage: Option<OpenAIUsage>,
    error: Option<OpenAIStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIStreamToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<OpenAIStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::circuit_breaker::CircuitBreakerConfig;
    use crate::models::retry::RetryPolicy;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_guard() -> Arc<CallGuard> {
        CallGuard::new(
            CircuitBreakerConfig::default(),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
        )
        .shared()
    }

    fn provider(server: &MockServer) -> OpenAIProvider {
        OpenAIProvider::new("test-key", test_guard())
            .unwrap()
            .with_base_url(format!("{}/v1", server.uri()))
    }

    fn completion_body() -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "Hello there" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
        })
    }

    #[test]
    fn test_provider_creation() {
        let provider = OpenAIProvider::new("test-key", test_guard()).unwrap();
        assert_eq!(provider.get_provider_name(), "openai");
        assert_eq!(provider.default_model(), DEFAULT_MODEL);
        assert!(provider.has_model("gpt-4o"));
        assert!(!provider.has_model("claude-3-5-sonnet-20241022"));
    }

    #[test]
    fn test_message_conversion() {
        let provider = OpenAIProvider::new("test-key", test_guard()).unwrap();
        let messages = vec![
            Message::system("You are a helpful assistant"),
            Message::user("Hello"),
            Message::assistant_tool_calls(vec![ToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: "{}".to_string(),
            }]),
            Message::tool("call_1", "42"),
        ];

        let converted = provider.convert_messages(&messages);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[1].role, "user");
        assert!(converted[2].content.is_none());
        assert_eq!(converted[2].tool_calls[0].function.name, "lookup");
        assert_eq!(converted[3].role, "tool");
        assert_eq!(converted[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_tool_choice_mapping() {
        assert_eq!(OpenAIProvider::convert_tool_choice(&ToolChoice::Auto), json!("auto"));
        assert_eq!(
            OpenAIProvider::convert_tool_choice(&ToolChoice::Tool("lookup".to_string())),
            json!({ "type": "function", "function": { "name": "lookup" } })
        );
    }

    #[test]
    fn test_stream_frame_parsing() {
        let frame = |data: &str| SseFrame {
            event: None,
            data: data.to_string(),
        };

        let events = OpenAIProvider::parse_stream_frame(&frame(
            r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        ))
        .unwrap();
        assert_eq!(events, vec![StreamEvent::Text("Hi".to_string())]);

        let events = OpenAIProvider::parse_stream_frame(&frame(
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":""}}]},"finish_reason":null}]}"#,
        ))
        .unwrap();
        assert!(matches!(&events[0], StreamEvent::ToolCall(d) if d.name.as_deref() == Some("lookup")));

        let events = OpenAIProvider::parse_stream_frame(&frame(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#,
        ))
        .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Usage {
                prompt_tokens: Some(5),
                completion_tokens: Some(7)
            }]
        );

        assert_eq!(
            OpenAIProvider::parse_stream_frame(&frame("[DONE]")).unwrap(),
            vec![StreamEvent::Done]
        );
        assert!(OpenAIProvider::parse_stream_frame(&frame("{not json")).is_err());
    }

    #[tokio::test]
    async fn test_complete_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({ "model": "gpt-4o-mini", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server);
        let result = provider
            .complete(CompletionOptions::new(vec![Message::user("Hello")]))
            .await
            .unwrap();

        assert_eq!(result.provider, "openai");
        assert_eq!(result.content, "Hello there");
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.usage.total_tokens, 15);
        assert!(provider.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_complete_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "tool_choice": "auto" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-2",
                "model": "gpt-4o",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": { "name": "lookup", "arguments": "{\"q\":\"rust\"}" }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": { "prompt_tokens": 20, "completion_tokens": 10 }
            })))
            .mount(&server)
            .await;

        let options = CompletionOptions::new(vec![Message::user("find rust")])
            .with_model("openai:gpt-4o")
            .with_tools(
                vec![ToolDefinition {
                    name: "lookup".to_string(),
                    description: Some("Search".to_string()),
                    parameters: json!({ "type": "object" }),
                }],
                ToolChoice::Auto,
            );
        let result = provider(&server).complete(options).await.unwrap();

        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].arguments, "{\"q\":\"rust\"}");
        assert_eq!(result.content, "");
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(CompletionOptions::new(vec![Message::user("Hello")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(4)
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(CompletionOptions::new(vec![Message::user("Hello")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { status: Some(503), .. }));
    }

    #[tokio::test]
    async fn test_streaming_with_usage() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: this is not json\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = provider(&server)
            .stream(CompletionOptions::new(vec![Message::user("Hello")]))
            .await
            .unwrap();
        let summary = stream.collect().await.unwrap();

        assert_eq!(summary.content, "Hello");
        assert_eq!(summary.finish_reason, Some(FinishReason::Stop));
        assert_eq!(summary.usage, Some(TokenUsage::new(4, 2)));
    }

    #[tokio::test]
    async fn test_health_check_reports_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = provider(&server).health_check(None).await;
        assert!(!result.healthy);
        assert_eq!(result.model, DEFAULT_MODEL);
        assert!(result.error.is_some());
    }
}
