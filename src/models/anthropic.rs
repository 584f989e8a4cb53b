use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Event;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::http::{build_client, probe, AdapterSettings, CallContext};
use crate::models::media::{validate_payload, MediaKind};
use crate::models::provider::{ChatCapability, FragmentCallback, Provider, ProviderInfo, VisionCapability};
use crate::models::registry::ProviderRegistry;
use crate::models::streaming::{read_sse, ChunkSource, StreamControl, StreamEnd};
use crate::models::types::{
    Capability, ChatRequest, ChatResponse, HealthStatus, Message, MessageRole, StreamFragment,
    TokenUsage, Transcript, VisionRequest,
};

pub const PROVIDER_NAME: &str = "anthropic";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const MIN_THINKING_BUDGET: u32 = 1024;
const DEFAULT_THINKING_BUDGET: u32 = 4096;

const CAPABILITIES: &[Capability] = &[Capability::Chat, Capability::Vision];

pub struct AnthropicProvider {
    client: Client,
    settings: AdapterSettings,
}

impl AnthropicProvider {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let client = build_client(PROVIDER_NAME, &settings)?;
        Ok(Self { client, settings })
    }

    fn api_key(&self) -> Result<&str> {
        self.settings.require_api_key(PROVIDER_NAME)
    }

    fn request(&self, method: reqwest::Method, path: &str, api_key: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.settings.url(path))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
    }

    /// The thinking budget must stay below `max_tokens`. A caller-supplied
    /// ceiling is never raised; the budget shrinks to fit under it instead.
    fn build_request(&self, request: &ChatRequest, stream: bool) -> Result<AnthropicRequest> {
        let quirks = self.settings.quirks_for(PROVIDER_NAME, &request.model);
        let (system, messages) = convert_messages(&request.messages);
        let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let thinking = if request.reasoning && quirks.supports_reasoning {
            let requested = request
                .reasoning_budget_tokens
                .unwrap_or(DEFAULT_THINKING_BUDGET)
                .max(MIN_THINKING_BUDGET);
            let budget = match request.max_tokens {
                Some(limit) if limit <= MIN_THINKING_BUDGET => {
                    return Err(Error::invalid_request(format!(
                        "Extended thinking needs max_tokens above {}, got {}",
                        MIN_THINKING_BUDGET, limit
                    )));
                }
                Some(limit) => requested.min(limit - 1),
                None => {
                    max_tokens = requested + DEFAULT_MAX_TOKENS;
                    requested
                }
            };
            Some(ThinkingConfig {
                kind: "enabled",
                budget_tokens: budget,
            })
        } else {
            if request.reasoning {
                debug!("Model {} does not support extended thinking, ignoring", request.model);
            }
            None
        };

        // Extended thinking rejects a custom temperature
        let temperature = if thinking.is_some() {
            None
        } else {
            quirks.temperature(request.temperature)
        };

        Ok(AnthropicRequest {
            model: request.model.clone(),
            max_tokens,
            messages,
            system,
            temperature,
            stream: stream.then_some(true),
            thinking,
        })
    }

    async fn send(&self, ctx: &CallContext<'_>, body: &AnthropicRequest) -> Result<ChatResponse> {
        let api_key = self.api_key()?;
        debug!("Making Anthropic API request to model: {}", body.model);

        let response = self
            .request(reqwest::Method::POST, "messages", api_key)
            .timeout(self.settings.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let parsed: AnthropicResponse = ctx.parse_json(response).await?;
        let mut transcript = Transcript::default();
        for block in parsed.content {
            match block {
                AnthropicBlock::Text { text } => transcript.push(&StreamFragment::Content(text)),
                AnthropicBlock::Thinking { thinking } => transcript.push(&StreamFragment::Reasoning(thinking)),
                AnthropicBlock::Other => {}
            }
        }

        let mut result = transcript.into_response(PROVIDER_NAME, &parsed.model);
        result.usage = Some(TokenUsage::new(parsed.usage.input_tokens, parsed.usage.output_tokens));
        result.finish_reason = parsed.stop_reason;
        Ok(result)
    }
}

/// System turns are lifted into the top-level `system` field.
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_message = String::new();
    let mut converted = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::System => {
                if !system_message.is_empty() {
                    system_message.push('\n');
                }
                system_message.push_str(&message.content);
            }
            MessageRole::User | MessageRole::Assistant => converted.push(AnthropicMessage {
                role: message.role.as_str(),
                content: AnthropicContent::Text(message.content.clone()),
            }),
        }
    }

    let system = (!system_message.is_empty()).then_some(system_message);
    (system, converted)
}

#[async_trait]
impl ProviderInfo for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_model(&self, capability: Capability) -> Option<&str> {
        self.settings.default_model(capability).or(match capability {
            Capability::Chat | Capability::Vision => Some("claude-sonnet-4-20250514"),
            _ => None,
        })
    }

    fn is_available(&self) -> bool {
        self.settings.api_key.is_some()
    }

    async fn get_status(&self) -> HealthStatus {
        match self.api_key() {
            Ok(api_key) => {
                probe(
                    self.request(reqwest::Method::GET, "models", api_key)
                        .timeout(self.settings.timeout),
                )
                .await
            }
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }
}

impl Provider for AnthropicProvider {
    fn register(self: Arc<Self>, registry: &mut ProviderRegistry) {
        registry.add_descriptor(self.clone());
        registry.add_chat(self.clone());
        registry.add_vision(self);
    }
}

#[async_trait]
impl ChatCapability for AnthropicProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.api_key()?;
        request.validate()?;
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, request.prompt_preview());
        let body = self.build_request(request, false)?;
        self.send(&ctx, &body).await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_fragment: FragmentCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let api_key = self.api_key()?;
        request.validate()?;
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, request.prompt_preview());
        let body = self.build_request(request, true)?;
        debug!("Starting streaming request to Anthropic: model={}", request.model);

        let response = self
            .request(reqwest::Method::POST, "messages", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;
        let mut response = ctx.check_status(response).await?;

        consume_stream(&mut response, &request.model, on_fragment, cancel).await
    }
}

pub(crate) async fn consume_stream<S: ChunkSource + ?Sized>(
    source: &mut S,
    model: &str,
    on_fragment: FragmentCallback<'_>,
    cancel: &CancellationToken,
) -> Result<ChatResponse> {
    let mut converter = AnthropicStreamConverter::default();
    let mut transcript = Transcript::default();

    let end = read_sse(source, PROVIDER_NAME, cancel, |event| {
        for fragment in converter.on_event(&event)? {
            transcript.push(&fragment);
            on_fragment(fragment);
        }
        Ok(if converter.done { StreamControl::Stop } else { StreamControl::Continue })
    })
    .await?;

    let mut response = transcript.into_response(PROVIDER_NAME, model);
    response.usage = converter.usage();
    response.finish_reason = match end {
        StreamEnd::Cancelled => Some("cancelled".to_string()),
        StreamEnd::Finished => converter.stop_reason,
    };
    Ok(response)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Other,
}

/// Converts Anthropic's named SSE events into fragments. Content blocks are
/// tracked by index so each delta is attributed to the block it belongs to.
#[derive(Debug, Default)]
pub(crate) struct AnthropicStreamConverter {
    blocks: HashMap<usize, BlockKind>,
    pub done: bool,
    pub stop_reason: Option<String>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl AnthropicStreamConverter {
    pub fn usage(&self) -> Option<TokenUsage> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (input, output) => Some(TokenUsage::new(input.unwrap_or(0), output.unwrap_or(0))),
        }
    }

    pub fn on_event(&mut self, event: &Event) -> Result<Vec<StreamFragment>> {
        let parsed: AnthropicStreamEvent = serde_json::from_str(&event.data).map_err(|e| {
            warn!("Malformed Anthropic event {}: {} (data: {})", event.event, e, event.data);
            Error::backend(PROVIDER_NAME, format!("Malformed stream chunk: {}", e))
        })?;

        let mut fragments = Vec::new();
        match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.input_tokens = Some(usage.input_tokens);
                    self.output_tokens = Some(usage.output_tokens);
                }
            }
            AnthropicStreamEvent::ContentBlockStart { index, content_block } => {
                let (kind, initial) = match content_block {
                    AnthropicBlock::Text { text } => (BlockKind::Text, StreamFragment::Content(text)),
                    AnthropicBlock::Thinking { thinking } => (BlockKind::Thinking, StreamFragment::Reasoning(thinking)),
                    AnthropicBlock::Other => (BlockKind::Other, StreamFragment::Content(String::new())),
                };
                self.blocks.insert(index, kind);
                if !initial.text().is_empty() {
                    fragments.push(initial);
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                let (delta_kind, text) = match delta {
                    AnthropicDelta::TextDelta { text } => (BlockKind::Text, text),
                    AnthropicDelta::ThinkingDelta { thinking } => (BlockKind::Thinking, thinking),
                    AnthropicDelta::Other => return Ok(fragments),
                };
                let kind = self.blocks.get(&index).copied().unwrap_or(delta_kind);
                if !text.is_empty() {
                    match kind {
                        BlockKind::Thinking => fragments.push(StreamFragment::Reasoning(text)),
                        BlockKind::Text => fragments.push(StreamFragment::Content(text)),
                        BlockKind::Other => {}
                    }
                }
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                self.blocks.remove(&index);
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(usage) = usage {
                    self.output_tokens = Some(usage.output_tokens);
                }
            }
            AnthropicStreamEvent::MessageStop => self.done = true,
            AnthropicStreamEvent::Error { error } => {
                return Err(Error::backend(
                    PROVIDER_NAME,
                    format!("Stream error ({}): {}", error.kind, error.message),
                ));
            }
            AnthropicStreamEvent::Ping | AnthropicStreamEvent::Unknown => {}
        }
        Ok(fragments)
    }
}

#[async_trait]
impl VisionCapability for AnthropicProvider {
    async fn describe_image(&self, request: &VisionRequest) -> Result<ChatResponse> {
        self.api_key()?;
        if request.images.is_empty() {
            return Err(Error::invalid_request("At least one image is required"));
        }
        for image in &request.images {
            validate_payload(MediaKind::Image, image)?;
        }
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, &request.prompt);
        let quirks = self.settings.quirks_for(PROVIDER_NAME, &request.model);

        let mut blocks: Vec<AnthropicInputBlock> = request
            .images
            .iter()
            .map(|image| AnthropicInputBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: crate::models::media::normalize_mime(&image.mime_type),
                    data: image.to_base64(),
                },
            })
            .collect();
        blocks.push(AnthropicInputBlock::Text {
            text: request.prompt.clone(),
        });

        let body = AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![AnthropicMessage {
                role: "user",
                content: AnthropicContent::Blocks(blocks),
            }],
            system: None,
            temperature: quirks.temperature(request.temperature),
            stream: None,
            thinking: None,
        };
        self.send(&ctx, &body).await
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicInputBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicInputBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: AnthropicBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: AnthropicDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: AnthropicMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::streaming::ScriptedChunks;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(AdapterSettings::new(DEFAULT_BASE_URL).with_api_key(Some("test-key".into()))).unwrap()
    }

    fn sse(event: &str, data: &str) -> String {
        format!("event: {}\ndata: {}\n\n", event, data)
    }

    #[test]
    fn test_message_conversion() {
        let messages = vec![
            Message::system("You are terse"),
            Message::user("Hello"),
            Message::assistant("Hi"),
        ];
        let (system, converted) = convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("You are terse"));
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "user");
        assert_eq!(converted[1].role, "assistant");
    }

    #[test]
    fn test_thinking_drops_temperature() {
        let provider = provider();
        let request = ChatRequest::new(vec![Message::user("why?")], "claude-sonnet-4-20250514")
            .with_temperature(0.3)
            .with_max_tokens(8000)
            .with_reasoning(Some(2000));

        let body = serde_json::to_value(provider.build_request(&request, true).unwrap()).unwrap();
        assert!(body.get("temperature").is_none());
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 2000);
        assert_eq!(body["max_tokens"], 8000);

        let request = ChatRequest::new(vec![Message::user("why?")], "claude-sonnet-4-20250514").with_temperature(0.3);
        let body = serde_json::to_value(provider.build_request(&request, false).unwrap()).unwrap();
        assert!(body.get("thinking").is_none());
        assert!(body.get("temperature").is_some());
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_thinking_budget_fits_under_caller_max_tokens() {
        let provider = provider();
        let request = ChatRequest::new(vec![Message::user("why?")], "claude-sonnet-4-20250514")
            .with_max_tokens(3000)
            .with_reasoning(Some(5000));
        let body = serde_json::to_value(provider.build_request(&request, true).unwrap()).unwrap();
        assert_eq!(body["max_tokens"], 3000);
        assert_eq!(body["thinking"]["budget_tokens"], 2999);

        let request = ChatRequest::new(vec![Message::user("why?")], "claude-sonnet-4-20250514")
            .with_max_tokens(1000)
            .with_reasoning(Some(2000));
        assert!(matches!(provider.build_request(&request, true), Err(Error::InvalidRequest(_))));

        // Without a caller ceiling the answer gets room beyond the budget
        let request = ChatRequest::new(vec![Message::user("why?")], "claude-sonnet-4-20250514").with_reasoning(None);
        let body = serde_json::to_value(provider.build_request(&request, true).unwrap()).unwrap();
        assert_eq!(body["thinking"]["budget_tokens"], DEFAULT_THINKING_BUDGET);
        assert_eq!(body["max_tokens"], DEFAULT_THINKING_BUDGET + DEFAULT_MAX_TOKENS);
    }

    #[tokio::test]
    async fn test_thinking_block_then_text_block() {
        let mut source = ScriptedChunks::new([
            sse("message_start", r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#),
            sse("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#),
            sse("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Considering the question"}}"#),
            sse("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}"#),
            sse("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            sse("content_block_start", r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#),
            sse("ping", r#"{"type":"ping"}"#),
            sse("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"The answer is 42."}}"#),
            sse("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
            sse("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":30}}"#),
            sse("message_stop", r#"{"type":"message_stop"}"#),
        ]);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let mut on_fragment = |fragment: StreamFragment| seen.push(fragment);

        let response = consume_stream(&mut source, "claude-sonnet-4-20250514", &mut on_fragment, &cancel)
            .await
            .unwrap();

        assert_eq!(
            seen,
            vec![
                StreamFragment::Reasoning("Considering the question".into()),
                StreamFragment::Content("The answer is 42.".into()),
            ]
        );
        assert_eq!(response.content, "The answer is 42.");
        assert_eq!(response.reasoning.as_deref(), Some("Considering the question"));
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage, Some(TokenUsage::new(12, 30)));
    }

    #[test]
    fn test_error_event_becomes_backend_error() {
        let mut converter = AnthropicStreamConverter::default();
        let event = Event {
            event: "error".into(),
            data: r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#.into(),
            id: String::new(),
            retry: None,
        };
        match converter.on_event(&event) {
            Err(Error::Backend { provider, message }) => {
                assert_eq!(provider, "anthropic");
                assert!(message.contains("Overloaded"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_event_fails_the_stream() {
        let mut source = ScriptedChunks::new([
            sse("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            sse("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#),
            sse("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" wor"#),
            sse("message_stop", r#"{"type":"message_stop"}"#),
        ]);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let mut on_fragment = |fragment: StreamFragment| seen.push(fragment);

        let result = consume_stream(&mut source, "claude-sonnet-4-20250514", &mut on_fragment, &cancel).await;
        match result {
            Err(Error::Backend { provider, message }) => {
                assert_eq!(provider, "anthropic");
                assert!(message.contains("Malformed stream chunk"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(seen, vec![StreamFragment::Content("Hi".into())]);
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let provider = AnthropicProvider::new(AdapterSettings::new(DEFAULT_BASE_URL)).unwrap();
        let request = ChatRequest::new(vec![Message::user("hi")], "claude-sonnet-4-20250514");
        let cancel = CancellationToken::new();
        let mut on_fragment = |_: StreamFragment| {};
        let result = provider.chat_stream(&request, &mut on_fragment, &cancel).await;
        assert!(matches!(result, Err(Error::CredentialsMissing { .. })));
    }
}
