use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::capability_detection::TokenLimitParam;
use crate::models::http::{build_client, probe, AdapterSettings, CallContext};
use crate::models::media::{decode_base64, file_extension, speech_mime, validate_payload, MediaKind};
use crate::models::provider::{
    ChatCapability, EmbeddingCapability, FragmentCallback, ImageGeneration, Provider, ProviderInfo,
    SpeechToText, TextToSpeech, VisionCapability,
};
use crate::models::registry::ProviderRegistry;
use crate::models::streaming::{read_lines, ChunkSource, StreamControl, StreamEnd};
use crate::models::types::{
    Capability, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, HealthStatus,
    ImageRequest, MediaDescriptor, MediaResponse, Message, SpeechRequest, StreamFragment, TokenUsage,
    TranscriptionRequest, TranscriptionResponse, Transcript, VisionRequest,
};

pub const PROVIDER_NAME: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const CAPABILITIES: &[Capability] = &[
    Capability::Chat,
    Capability::Vision,
    Capability::Embeddings,
    Capability::ImageGeneration,
    Capability::SpeechToText,
    Capability::TextToSpeech,
];

/// Adapter for the OpenAI REST API and compatible servers.
pub struct OpenAIProvider {
    client: Client,
    settings: AdapterSettings,
}

impl OpenAIProvider {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let client = build_client(PROVIDER_NAME, &settings)?;
        Ok(Self { client, settings })
    }

    fn api_key(&self) -> Result<&str> {
        self.settings.require_api_key(PROVIDER_NAME)
    }

    fn post(&self, path: &str, api_key: &str) -> reqwest::RequestBuilder {
        self.client.post(self.settings.url(path)).bearer_auth(api_key)
    }

    fn build_chat_body(&self, request: &ChatRequest, stream: bool) -> OpenAIChatRequest {
        let quirks = self.settings.quirks_for(PROVIDER_NAME, &request.model);
        let mut body = OpenAIChatRequest {
            model: request.model.clone(),
            messages: convert_messages(&request.messages),
            temperature: quirks.temperature(request.temperature),
            max_tokens: None,
            max_completion_tokens: None,
            reasoning_effort: None,
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
            user: request.user_id.clone(),
        };

        body.set_token_limit(quirks.token_limit_param, request.max_tokens);
        if request.reasoning && quirks.supports_reasoning {
            body.reasoning_effort = Some(reasoning_effort(request.reasoning_budget_tokens));
        }
        body
    }

    async fn send_chat(&self, ctx: &CallContext<'_>, body: &OpenAIChatRequest) -> Result<ChatResponse> {
        let api_key = self.api_key()?;
        let response = self
            .post("chat/completions", api_key)
            .timeout(self.settings.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let parsed: OpenAIChatResponse = ctx.parse_json(response).await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ctx.failure("No choices in response"))?;

        let mut result = ChatResponse::new(PROVIDER_NAME, &parsed.model, choice.message.content.unwrap_or_default());
        result.reasoning = choice.message.reasoning_content.filter(|r| !r.is_empty());
        result.finish_reason = choice.finish_reason;
        result.usage = parsed.usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        debug!("Received response from OpenAI: id={}", parsed.id);
        Ok(result)
    }
}

fn reasoning_effort(budget_tokens: Option<u32>) -> String {
    match budget_tokens {
        Some(budget) if budget < 2048 => "low",
        Some(budget) if budget > 8192 => "high",
        _ => "medium",
    }
    .to_string()
}

fn convert_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    messages
        .iter()
        .map(|msg| OpenAIMessage {
            role: msg.role.as_str().to_string(),
            content: OpenAIContent::Text(msg.content.clone()),
        })
        .collect()
}

#[async_trait]
impl ProviderInfo for OpenAIProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_model(&self, capability: Capability) -> Option<&str> {
        self.settings.default_model(capability).or(match capability {
            Capability::Chat => Some("gpt-4o-mini"),
            Capability::Vision => Some("gpt-4o"),
            Capability::Embeddings => Some("text-embedding-3-small"),
            Capability::ImageGeneration => Some("gpt-image-1"),
            Capability::SpeechToText => Some("whisper-1"),
            Capability::TextToSpeech => Some("gpt-4o-mini-tts"),
            Capability::VideoGeneration => None,
        })
    }

    fn is_available(&self) -> bool {
        self.settings.api_key.is_some()
    }

    async fn get_status(&self) -> HealthStatus {
        match self.api_key() {
            Ok(api_key) => {
                probe(
                    self.client
                        .get(self.settings.url("models"))
                        .bearer_auth(api_key)
                        .timeout(self.settings.timeout),
                )
                .await
            }
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }
}

impl Provider for OpenAIProvider {
    fn register(self: Arc<Self>, registry: &mut ProviderRegistry) {
        registry.add_descriptor(self.clone());
        registry.add_chat(self.clone());
        registry.add_vision(self.clone());
        registry.add_embeddings(self.clone());
        registry.add_image_generation(self.clone());
        registry.add_speech_to_text(self.clone());
        registry.add_text_to_speech(self);
    }
}

#[async_trait]
impl ChatCapability for OpenAIProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.api_key()?;
        request.validate()?;
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, request.prompt_preview());
        debug!("Sending request to OpenAI: model={}, messages={}", request.model, request.messages.len());

        let body = self.build_chat_body(request, false);
        self.send_chat(&ctx, &body).await
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
        debug!("Starting streaming request to OpenAI: model={}", request.model);

        let body = self.build_chat_body(request, true);
        let response = self
            .post("chat/completions", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;
        let mut response = ctx.check_status(response).await?;

        consume_stream(&mut response, &request.model, on_fragment, cancel).await
    }
}

/// Read an OpenAI-style `data:` stream to completion.
pub(crate) async fn consume_stream<S: ChunkSource + ?Sized>(
    source: &mut S,
    model: &str,
    on_fragment: FragmentCallback<'_>,
    cancel: &CancellationToken,
) -> Result<ChatResponse> {
    let mut converter = OpenAIStreamConverter::default();
    let mut transcript = Transcript::default();

    let end = read_lines(source, PROVIDER_NAME, cancel, |line| {
        for fragment in converter.on_line(line)? {
            transcript.push(&fragment);
            on_fragment(fragment);
        }
        Ok(if converter.done { StreamControl::Stop } else { StreamControl::Continue })
    })
    .await?;

    let mut response = transcript.into_response(PROVIDER_NAME, model);
    response.usage = converter.usage;
    response.finish_reason = match end {
        StreamEnd::Cancelled => Some("cancelled".to_string()),
        StreamEnd::Finished => converter.finish_reason,
    };
    Ok(response)
}

/// Turns `data: {json}` lines into fragments; `data: [DONE]` ends the stream.
#[derive(Debug, Default)]
pub(crate) struct OpenAIStreamConverter {
    pub done: bool,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl OpenAIStreamConverter {
    pub fn on_line(&mut self, line: &str) -> Result<Vec<StreamFragment>> {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return Ok(Vec::new());
        };
        if data == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }

        let chunk: OpenAIStreamChunk = serde_json::from_str(data).map_err(|e| {
            warn!("Malformed OpenAI stream chunk: {} (data: {})", e, data);
            Error::backend(PROVIDER_NAME, format!("Malformed stream chunk: {}", e))
        })?;

        if let Some(error) = chunk.error {
            return Err(Error::backend(PROVIDER_NAME, format!("Stream error: {}", error.message)));
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        let mut fragments = Vec::new();
        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content.or(choice.delta.reasoning) {
                if !reasoning.is_empty() {
                    fragments.push(StreamFragment::Reasoning(reasoning));
                }
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    fragments.push(StreamFragment::Content(content));
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        Ok(fragments)
    }
}

#[async_trait]
impl VisionCapability for OpenAIProvider {
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

        let mut parts = vec![OpenAIContentPart::Text {
            text: request.prompt.clone(),
        }];
        parts.extend(request.images.iter().map(|image| OpenAIContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image.to_data_url(),
            },
        }));

        let mut body = OpenAIChatRequest {
            model: request.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: OpenAIContent::Parts(parts),
            }],
            temperature: quirks.temperature(request.temperature),
            max_tokens: None,
            max_completion_tokens: None,
            reasoning_effort: None,
            stream: None,
            stream_options: None,
            user: None,
        };
        body.set_token_limit(quirks.token_limit_param, request.max_tokens);

        self.send_chat(&ctx, &body).await
    }
}

#[async_trait]
impl EmbeddingCapability for OpenAIProvider {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let api_key = self.api_key()?;
        if request.input.is_empty() {
            return Err(Error::invalid_request("Embedding input is empty"));
        }
        let preview = request.input.first().map(String::as_str).unwrap_or_default();
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, preview);

        let body = OpenAIEmbeddingRequest {
            model: &request.model,
            input: &request.input,
            dimensions: request.dimensions,
        };
        let response = self
            .post("embeddings", api_key)
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let mut parsed: OpenAIEmbeddingResponse = ctx.parse_json(response).await?;
        parsed.data.sort_by_key(|item| item.index);

        Ok(EmbeddingResponse {
            provider: PROVIDER_NAME.to_string(),
            model: parsed.model,
            embeddings: parsed.data.into_iter().map(|item| item.embedding).collect(),
            usage: parsed.usage.map(|u| TokenUsage::new(u.prompt_tokens, 0)),
        })
    }
}

#[async_trait]
impl ImageGeneration for OpenAIProvider {
    async fn generate_image(&self, request: &ImageRequest) -> Result<MediaResponse> {
        let api_key = self.api_key()?;
        if request.prompt.trim().is_empty() {
            return Err(Error::invalid_request("Image prompt is empty"));
        }
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, &request.prompt);

        let body = OpenAIImageRequest {
            model: &request.model,
            prompt: &request.prompt,
            n: request.count.max(1),
            size: request.size.as_deref(),
            quality: request.quality.as_deref(),
            // gpt-image models always return base64 and reject this field
            response_format: request.model.starts_with("dall-e").then_some("b64_json"),
        };
        let response = self
            .post("images/generations", api_key)
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let parsed: OpenAIImageResponse = ctx.parse_json(response).await?;
        if parsed.data.is_empty() {
            return Err(ctx.failure("No images in response"));
        }

        let items = parsed
            .data
            .into_iter()
            .map(|item| {
                let mut descriptor = match item.b64_json {
                    Some(data) => MediaDescriptor::inline("image/png", &decode_base64(PROVIDER_NAME, &data)?),
                    None => MediaDescriptor {
                        mime_type: "image/png".to_string(),
                        data_base64: None,
                        url: item.url,
                        revised_prompt: None,
                    },
                };
                descriptor.revised_prompt = item.revised_prompt;
                Ok(descriptor)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(MediaResponse {
            provider: PROVIDER_NAME.to_string(),
            model: request.model.clone(),
            items,
        })
    }
}

#[async_trait]
impl SpeechToText for OpenAIProvider {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<TranscriptionResponse> {
        let api_key = self.api_key()?;
        validate_payload(MediaKind::Audio, &request.audio)?;
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, request.prompt.as_deref().unwrap_or_default());

        let file_name = format!("audio.{}", file_extension(&request.audio.mime_type));
        let part = Part::bytes(request.audio.data.clone())
            .file_name(file_name)
            .mime_str(&request.audio.mime_type)
            .map_err(|e| Error::invalid_request(format!("Invalid audio MIME type: {}", e)))?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", request.model.clone())
            .text("response_format", "json");
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }

        let response = self
            .post("audio/transcriptions", api_key)
            .timeout(self.settings.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let parsed: OpenAITranscription = ctx.parse_json(response).await?;
        Ok(TranscriptionResponse {
            provider: PROVIDER_NAME.to_string(),
            model: request.model.clone(),
            text: parsed.text,
            language: parsed.language.or_else(|| request.language.clone()),
            duration_seconds: parsed.duration,
        })
    }
}

#[async_trait]
impl TextToSpeech for OpenAIProvider {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<MediaResponse> {
        let api_key = self.api_key()?;
        if request.text.trim().is_empty() {
            return Err(Error::invalid_request("Speech input is empty"));
        }
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, &request.text);
        let format = request.format.as_deref().unwrap_or("mp3");

        let body = OpenAISpeechRequest {
            model: &request.model,
            input: &request.text,
            voice: request.voice.as_deref().unwrap_or("alloy"),
            response_format: format,
        };
        let response = self
            .post("audio/speech", api_key)
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let audio = ctx.bytes(response).await?;
        if audio.is_empty() {
            return Err(ctx.failure("Empty audio in response"));
        }

        Ok(MediaResponse {
            provider: PROVIDER_NAME.to_string(),
            model: request.model.clone(),
            items: vec![MediaDescriptor::inline(speech_mime(format), &audio)],
        })
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

impl OpenAIChatRequest {
    fn set_token_limit(&mut self, param: TokenLimitParam, limit: Option<u32>) {
        match param {
            TokenLimitParam::MaxTokens => self.max_tokens = limit,
            TokenLimitParam::MaxCompletionTokens => self.max_completion_tokens = limit,
        }
    }
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: OpenAIContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    id: String,
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
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
    #[serde(default)]
    error: Option<OpenAIErrorBody>,
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
    reasoning_content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    model: String,
    data: Vec<OpenAIEmbedding>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAIImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OpenAIImageResponse {
    data: Vec<OpenAIImage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIImage {
    b64_json: Option<String>,
    url: Option<String>,
    revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAITranscription {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OpenAISpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}
