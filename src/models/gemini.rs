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
use uuid::Uuid;

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

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct GeminiProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    models: Vec<ModelInfo>,
    guard: Arc<CallGuard>,
    in_flight: InFlightRequests,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, guard: Arc<CallGuard>) -> Result<Self> {
        Ok(Self {
            name: "gemini".to_string(),
            client: http::build_client(Duration::from_secs(60))?,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            models: Self::catalog("gemini"),
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
                "gemini-1.5-pro",
                "Gemini 1.5 Pro",
                2_000_000,
                8_192,
                Decimal::new(125, 5),
                Decimal::new(5, 3),
                QualityTier::Premium,
                SpeedTier::Medium,
            ),
            ModelInfo::priced(
                provider,
                "gemini-1.5-flash",
                "Gemini 1.5 Flash",
                1_000_000,
                8_192,
                Decimal::new(75, 6),
                Decimal::new(3, 4),
                QualityTier::Standard,
                SpeedTier::Fast,
            ),
            ModelInfo::priced(
                provider,
                "gemini-2.0-flash",
                "Gemini 2.0 Flash",
                1_000_000,
                8_192,
                Decimal::new(1, 4),
                Decimal::new(4, 4),
                QualityTier::Standard,
                SpeedTier::Fast,
            ),
        ]
    }

    /// Gemini has no tool-call ids; a tool result is matched back to its
    /// function name through the assistant turn that issued the call.
    fn convert_messages(&self, messages: &[Message]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
        let mut system_parts = Vec::new();
        let mut contents: Vec<GeminiContent> = Vec::new();
        let mut call_names: HashMap<&str, &str> = HashMap::new();

        for message in messages {
            let (role, parts) = match message.role {
                MessageRole::System => {
                    system_parts.push(json!({ "text": message.content }));
                    continue;
                }
                MessageRole::User => ("user", vec![json!({ "text": message.content })]),
                MessageRole::Assistant => {
                    let mut parts = Vec::new();
                    if !message.content.is_empty() {
                        parts.push(json!({ "text": message.content }));
                    }
                    for call in &message.tool_calls {
                        call_names.insert(call.id.as_str(), call.name.as_str());
                        let args: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                        parts.push(json!({ "functionCall": { "name": call.name, "args": args } }));
                    }
                    ("model", parts)
                }
                MessageRole::Tool => {
                    let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                    let name = call_names.get(call_id).copied().unwrap_or(call_id);
                    let response: Value = serde_json::from_str(&message.content)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({ "content": message.content }));
                    ("user", vec![json!({ "functionResponse": { "name": name, "response": response } })])
                }
            };

            match contents.last_mut() {
                Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
                _ => contents.push(GeminiContent {
                    role: Some(role.to_string()),
                    parts,
                }),
            }
        }

        let system = (!system_parts.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system_parts,
        });
        (system, contents)
    }

    fn convert_tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!({ "functionCallingConfig": { "mode": "AUTO" } }),
            ToolChoice::None => json!({ "functionCallingConfig": { "mode": "NONE" } }),
            ToolChoice::Tool(name) => json!({
                "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [name] }
            }),
        }
    }

    fn build_request(&self, options: &CompletionOptions) -> GeminiRequest {
        let (system_instruction, contents) = self.convert_messages(&options.messages);
        let tools = if options.tools.is_empty() {
            Vec::new()
        } else {
            let declarations: Vec<Value> = options
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect();
            vec![json!({ "functionDeclarations": declarations })]
        };

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_tokens,
                top_p: options.top_p,
                stop_sequences: options.stop.clone(),
            },
            tool_config: if options.tools.is_empty() {
                None
            } else {
                options.tool_choice.as_ref().map(Self::convert_tool_choice)
            },
            tools,
        }
    }

    async fn post(
        &self,
        model: &str,
        body: &GeminiRequest,
        stream: bool,
        cancel: &CancellationToken,
        request_id: &str,
    ) -> Result<Response> {
        let base = self.base_url.trim_end_matches('/');
        let url = if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", base, model)
        } else {
            format!("{}/models/{}:generateContent", base, model)
        };
        let request = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(body);
        http::send(&self.name, request, cancel, request_id).await
    }

    async fn make_request(
        &self,
        model: &str,
        body: &GeminiRequest,
        cancel: &CancellationToken,
        request_id: &str,
    ) -> Result<GeminiResponse> {
        debug!("Sending request to {}: model={}, contents={}", self.name, model, body.contents.len());
        let response = self.post(model, body, false, cancel, request_id).await?;
        http::read_json(&self.name, response, cancel, request_id).await
    }

    fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
        match reason {
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT")
            | Some("SPII") => FinishReason::ContentFilter,
            _ if has_tool_calls => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }

    fn build_result(
        &self,
        response: GeminiResponse,
        request_id: &str,
        model: &str,
        latency_ms: u64,
    ) -> Result<CompletionResult> {
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(Error::provider(&self.name, format!("Prompt blocked: {}", reason)));
        }
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider(&self.name, "No candidates in response"))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                content.push_str(&text);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    name: call.name,
                    arguments: call.args.to_string(),
                });
            }
        }

        let usage = response
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(CompletionResult {
            id: response
                .response_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            request_id: request_id.to_string(),
            provider: self.name.clone(),
            model: response.model_version.unwrap_or_else(|| model.to_string()),
            content,
            finish_reason: Self::map_finish_reason(candidate.finish_reason.as_deref(), !tool_calls.is_empty()),
            usage,
            tool_calls,
            latency_ms,
            cached: false,
            created_at: Utc::now(),
        })
    }
}

/// Each SSE frame carries a complete `GenerateContentResponse` fragment;
/// function calls arrive whole, one per part.
#[derive(Debug, Default)]
pub struct GeminiStreamParser {
    tool_calls: u32,
}

impl GeminiStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        let chunk: GeminiStreamChunk = serde_json::from_str(&frame.data)?;
        if let Some(error) = chunk.error {
            return Ok(vec![StreamEvent::Error(error.message)]);
        }

        let mut events = Vec::new();
        if let Some(reason) = chunk.response.prompt_feedback.and_then(|f| f.block_reason) {
            debug!("Gemini prompt blocked: {}", reason);
            events.push(StreamEvent::Finish(FinishReason::ContentFilter));
        }
        for candidate in chunk.response.candidates.into_iter().take(1) {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    events.push(StreamEvent::Text(text));
                }
                if let Some(call) = part.function_call {
                    events.push(StreamEvent::ToolCall(ToolCallDelta {
                        index: self.tool_calls,
                        id: Some(format!("call_{}", Uuid::new_v4().simple())),
                        name: Some(call.name),
                        arguments_delta: call.args.to_string(),
                    }));
                    self.tool_calls += 1;
                }
            }
            if let Some(reason) = candidate.finish_reason {
                events.push(StreamEvent::Finish(GeminiProvider::map_finish_reason(
                    Some(&reason),
                    self.tool_calls > 0,
                )));
            }
        }
        if let Some(usage) = chunk.response.usage_metadata {
            events.push(StreamEvent::Usage {
                prompt_tokens: Some(usage.prompt_token_count),
                completion_tokens: Some(usage.candidates_token_count),
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
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
        let body = self.build_request(&options);
        let estimated = options.estimated_tokens(DEFAULT_MAX_TOKENS);

        let start_time = Instant::now();
        let response = self
            .guard
            .execute(&self.name, &model, estimated, &request, |_| {
                self.make_request(&model, &body, request.token(), &options.request_id)
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
        let body = self.build_request(&options);
        let estimated = options.estimated_tokens(DEFAULT_MAX_TOKENS);

        let response = self
            .guard
            .execute(&self.name, &model, estimated, &request, |_| {
                self.post(&model, &body, true, request.token(), &options.request_id)
            })
            .await?;

        let (sender, stream) = ChatStream::channel(&options.request_id, request.token().clone());
        let provider = self.name.clone();
        let guard = self.guard.clone();
        tokio::spawn(async move {
            let _request = request;
            let mut parser = GeminiStreamParser::new();
            if let Some(usage) = pump_sse(&provider, response, sender, |frame| parser.parse(frame)).await {
                guard.record_token_usage(&provider, usage.total_tokens);
            }
        });
        Ok(stream)
    }

    async fn health_check(&self, model: Option<&str>) -> HealthCheckResult {
        let model = resolve_model_id(model, &self.name, &self.default_model);
        let options = CompletionOptions::new(vec![Message::user("ping")]).with_max_tokens(1);
        let body = self.build_request(&options);
        let cancel = CancellationToken::new();

        let start_time = Instant::now();
        match self.make_request(&model, &body, &cancel, &options.request_id).await {
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
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<Value>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
    model_version: Option<String>,
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiStreamChunk {
    #[serde(flatten)]
    response: GeminiResponse,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}
