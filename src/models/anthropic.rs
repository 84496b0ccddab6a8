use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
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
    InFlightRequests, Message, MessageRole, ModelInfo, ModelProvider, QualityTier, SpeedTier,
    TokenUsage, ToolCall, ToolCallDelta, ToolChoice,
};
use crate::models::streaming::{pump_sse, ChatStream, SseFrame, StreamEvent};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";
const API_VERSION: &str = "2023-06-01";
/// The messages API requires `max_tokens` on every request.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    models: Vec<ModelInfo>,
    guard: Arc<CallGuard>,
    in_flight: InFlightRequests,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, guard: Arc<CallGuard>) -> Result<Self> {
        Ok(Self {
            name: "anthropic".to_string(),
            client: http::build_client(Duration::from_secs(120))?,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            models: Self::catalog("anthropic"),
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
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::authentication(name, "no API key configured"))?;
        Ok(Self {
            name: name.to_string(),
            client: http::build_client(timeout)?,
            api_key,
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
                "claude-3-5-sonnet-20241022",
                "Claude 3.5 Sonnet",
                200_000,
                8_192,
                Decimal::new(3, 3),
                Decimal::new(15, 3),
                QualityTier::Premium,
                SpeedTier::Medium,
            ),
            ModelInfo::priced(
                provider,
                "claude-3-5-haiku-20241022",
                "Claude 3.5 Haiku",
                200_000,
                8_192,
                Decimal::new(8, 4),
                Decimal::new(4, 3),
                QualityTier::Standard,
                SpeedTier::Fast,
            ),
            ModelInfo::priced(
                provider,
                "claude-3-opus-20240229",
                "Claude 3 Opus",
                200_000,
                4_096,
                Decimal::new(15, 3),
                Decimal::new(75, 3),
                QualityTier::Premium,
                SpeedTier::Slow,
            ),
        ]
    }

    /// Splits out the system prompt and folds consecutive same-role turns
    /// into one message, since the API requires alternating roles. Tool
    /// results travel as user turns.
    fn convert_messages(&self, messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system_message = String::new();
        let mut converted: Vec<AnthropicMessage> = Vec::new();

        for message in messages {
            let (role, blocks) = match message.role {
                MessageRole::System => {
                    if !system_message.is_empty() {
                        system_message.push('\n');
                    }
                    system_message.push_str(&message.content);
                    continue;
                }
                MessageRole::User => ("user", vec![ContentBlock::Text {
                    text: message.content.clone(),
                }]),
                MessageRole::Tool => ("user", vec![ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.content.clone(),
                }]),
                MessageRole::Assistant => {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: message.content.clone(),
                        });
                    }
                    for call in &message.tool_calls {
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({})),
                        });
                    }
                    ("assistant", blocks)
                }
            };

            match converted.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => converted.push(AnthropicMessage {
                    role: role.to_string(),
                    content: blocks,
                }),
            }
        }

        let system = (!system_message.is_empty()).then_some(system_message);
        (system, converted)
    }

    fn convert_tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!({ "type": "auto" }),
            ToolChoice::None => json!({ "type": "none" }),
            ToolChoice::Tool(name) => json!({ "type": "tool", "name": name }),
        }
    }

    fn build_request(&self, options: &CompletionOptions, model: &str, stream: bool) -> AnthropicRequest {
        let (system, messages) = self.convert_messages(&options.messages);
        AnthropicRequest {
            model: model.to_string(),
            system,
            messages,
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: options.temperature,
            top_p: options.top_p,
            stop_sequences: options.stop.clone(),
            tools: options
                .tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect(),
            tool_choice: if options.tools.is_empty() {
                None
            } else {
                options.tool_choice.as_ref().map(Self::convert_tool_choice)
            },
            stream,
        }
    }

    async fn post(&self, body: &AnthropicRequest, cancel: &CancellationToken, request_id: &str) -> Result<Response> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        let request = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body);
        http::send(&self.name, request, cancel, request_id).await
    }

    async fn make_request(
        &self,
        body: &AnthropicRequest,
        cancel: &CancellationToken,
        request_id: &str,
    ) -> Result<AnthropicResponse> {
        debug!("Making {} API request to model: {}", self.name, body.model);
        let response = self.post(body, cancel, request_id).await?;
        http::read_json(&self.name, response, cancel, request_id).await
    }

    fn map_stop_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            Some("refusal") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    fn build_result(&self, response: AnthropicResponse, request_id: &str, latency_ms: u64) -> CompletionResult {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ResponseBlock::Text { text } => content.push_str(&text),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ResponseBlock::Other => {}
            }
        }

        CompletionResult {
            id: response.id,
            request_id: request_id.to_string(),
            provider: self.name.clone(),
            model: response.model,
            content,
            finish_reason: Self::map_stop_reason(response.stop_reason.as_deref()),
            usage: TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens),
            tool_calls,
            latency_ms,
            cached: false,
            created_at: Utc::now(),
        }
    }
}

/// Translates the messages-API event stream. Content block indices count
/// text blocks too, so tool blocks are renumbered densely.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    tool_indices: HashMap<u32, u32>,
}

impl AnthropicStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        let event: AnthropicStreamEvent = serde_json::from_str(&frame.data)?;
        let events = match event {
            AnthropicStreamEvent::MessageStart { message } => vec![StreamEvent::Usage {
                prompt_tokens: message.usage.input_tokens,
                completion_tokens: message.usage.output_tokens,
            }],
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StreamBlock::ToolUse { id, name } => {
                    let ordinal = self.tool_indices.len() as u32;
                    self.tool_indices.insert(index, ordinal);
                    vec![StreamEvent::ToolCall(ToolCallDelta {
                        index: ordinal,
                        id: Some(id),
                        name: Some(name),
                        arguments_delta: String::new(),
                    })]
                }
                StreamBlock::Text { text } => vec![StreamEvent::Text(text)],
                StreamBlock::Other => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![StreamEvent::Text(text)],
                BlockDelta::InputJsonDelta { partial_json } => match self.tool_indices.get(&index) {
                    Some(ordinal) => vec![StreamEvent::ToolCall(ToolCallDelta {
                        index: *ordinal,
                        id: None,
                        name: None,
                        arguments_delta: partial_json,
                    })],
                    None => Vec::new(),
                },
                BlockDelta::Other => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let mut events = Vec::new();
                if let Some(reason) = delta.stop_reason {
                    events.push(StreamEvent::Finish(AnthropicProvider::map_stop_reason(Some(&reason))));
                }
                if let Some(usage) = usage {
                    events.push(StreamEvent::Usage {
                        prompt_tokens: usage.input_tokens,
                        completion_tokens: usage.output_tokens,
                    });
                }
                events
            }
            AnthropicStreamEvent::MessageStop => vec![StreamEvent::Done],
            AnthropicStreamEvent::Error { error } => vec![StreamEvent::Error(error.message)],
            AnthropicStreamEvent::Other => Vec::new(),
        };
        Ok(events)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
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

        let result = self.build_result(response, &options.request_id, latency_ms);
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
            let mut parser = AnthropicStreamParser::new();
            if let Some(usage) = pump_sse(&provider, response, sender, |frame| parser.parse(frame)).await {
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
struct AnthropicRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: StreamBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: Option<StreamUsage>,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: StreamUsage,
}

#[derive(Debug, Default, Deserialize)]
struct StreamUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::circuit_breaker::CircuitBreakerConfig;
    use crate::models::provider::ToolDefinition;
    use crate::models::retry::RetryPolicy;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_guard() -> Arc<CallGuard> {
        CallGuard::new(CircuitBreakerConfig::default(), RetryPolicy::no_retries()).shared()
    }

    fn provider(server: &MockServer) -> AnthropicProvider {
        AnthropicProvider::new("test-key", test_guard())
            .unwrap()
            .with_base_url(format!("{}/v1", server.uri()))
    }

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_message_conversion_merges_turns() {
        let provider = AnthropicProvider::new("test-key", test_guard()).unwrap();
        let messages = vec![
            Message::system("Be terse."),
            Message::user("What is 6*7?"),
            Message::assistant_tool_calls(vec![ToolCall {
                id: "toolu_1".to_string(),
                name: "calc".to_string(),
                arguments: "{\"expr\":\"6*7\"}".to_string(),
            }]),
            Message::tool("toolu_1", "42"),
            Message::user("Thanks"),
        ];

        let (system, converted) = provider.convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("Be terse."));
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[1].role, "assistant");
        assert_eq!(converted[2].role, "user");
        assert_eq!(converted[2].content.len(), 2);

        let json = serde_json::to_value(&converted[2]).unwrap();
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_stream_parser_renumbers_tool_blocks() {
        let mut parser = AnthropicStreamParser::new();
        parser
            .parse(&frame(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#))
            .unwrap();
        let events = parser
            .parse(&frame(
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"calc","input":{}}}"#,
            ))
            .unwrap();
        assert!(matches!(&events[0], StreamEvent::ToolCall(d) if d.index == 0 && d.id.as_deref() == Some("toolu_1")));

        let events = parser
            .parse(&frame(
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"expr\""}}"#,
            ))
            .unwrap();
        assert!(matches!(&events[0], StreamEvent::ToolCall(d) if d.index == 0 && d.arguments_delta == "{\"expr\""));

        let events = parser
            .parse(&frame(
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":15}}"#,
            ))
            .unwrap();
        assert_eq!(events[0], StreamEvent::Finish(FinishReason::ToolCalls));

        assert_eq!(parser.parse(&frame(r#"{"type":"ping"}"#)).unwrap(), vec![]);
        assert_eq!(
            parser.parse(&frame(r#"{"type":"message_stop"}"#)).unwrap(),
            vec![StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_complete_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .and(body_partial_json(json!({ "system": "Be terse.", "max_tokens": 1024 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-haiku-20241022",
                "content": [{ "type": "text", "text": "42" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 10, "output_tokens": 1 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let options = CompletionOptions::new(vec![Message::system("Be terse."), Message::user("6*7?")]);
        let result = provider(&server).complete(options).await.unwrap();

        assert_eq!(result.content, "42");
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.usage, TokenUsage::new(10, 1));
    }

    #[tokio::test]
    async fn test_tool_use_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({ "tool_choice": { "type": "tool", "name": "calc" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_2",
                "model": "claude-3-5-sonnet-20241022",
                "content": [
                    { "type": "text", "text": "Calculating." },
                    { "type": "tool_use", "id": "toolu_1", "name": "calc", "input": { "expr": "6*7" } }
                ],
                "stop_reason": "tool_use",
                "usage": { "input_tokens": 30, "output_tokens": 12 }
            })))
            .mount(&server)
            .await;

        let options = CompletionOptions::new(vec![Message::user("6*7?")]).with_tools(
            vec![ToolDefinition {
                name: "calc".to_string(),
                description: None,
                parameters: json!({ "type": "object" }),
            }],
            ToolChoice::Tool("calc".to_string()),
        );
        let result = provider(&server).complete(options).await.unwrap();

        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        assert_eq!(result.tool_calls[0].name, "calc");
        assert_eq!(result.tool_calls[0].arguments, "{\"expr\":\"6*7\"}");
    }

    #[tokio::test]
    async fn test_rate_limited_response_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(json!({
                        "type": "error",
                        "error": { "type": "rate_limit_error", "message": "Too many requests" }
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .complete(CompletionOptions::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[tokio::test]
    async fn test_streaming() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":9,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi \"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"there\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = provider(&server)
            .stream(CompletionOptions::new(vec![Message::user("hello")]))
            .await
            .unwrap();
        let summary = stream.collect().await.unwrap();

        assert_eq!(summary.content, "Hi there");
        assert_eq!(summary.finish_reason, Some(FinishReason::Length));
        assert_eq!(summary.usage, Some(TokenUsage::new(9, 2)));
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = ProviderConfig::default();
        let result = AnthropicProvider::from_config("anthropic", &config, Duration::from_secs(5), test_guard());
        assert!(matches!(result, Err(Error::Authentication { .. })));
    }
}
