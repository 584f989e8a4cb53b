use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Event;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::http::{build_client, probe, AdapterSettings, CallContext};
use crate::models::media::{normalize_mime, validate_payload, MediaKind};
use crate::models::operation::{OperationHandle, OperationStatus};
use crate::models::provider::{
    ChatCapability, EmbeddingCapability, FragmentCallback, Provider, ProviderInfo, VideoGeneration,
    VisionCapability,
};
use crate::models::registry::ProviderRegistry;
use crate::models::streaming::{read_sse, ChunkSource, StreamControl, StreamEnd};
use crate::models::types::{
    Capability, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, HealthStatus,
    MediaDescriptor, MediaResponse, Message, MessageRole, StreamFragment, TokenUsage, Transcript,
    VideoRequest, VisionRequest,
};

pub const PROVIDER_NAME: &str = "gemini";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const CAPABILITIES: &[Capability] = &[
    Capability::Chat,
    Capability::Vision,
    Capability::Embeddings,
    Capability::VideoGeneration,
];

pub struct GeminiProvider {
    client: Client,
    settings: AdapterSettings,
}

impl GeminiProvider {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let client = build_client(PROVIDER_NAME, &settings)?;
        Ok(Self { client, settings })
    }

    fn api_key(&self) -> Result<&str> {
        self.settings.require_api_key(PROVIDER_NAME)
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        self.settings.url(&format!("models/{}:{}", model, method))
    }

    fn generation_config(&self, request: &ChatRequest) -> GeminiGenerationConfig {
        let quirks = self.settings.quirks_for(PROVIDER_NAME, &request.model);
        let thinking_config = (request.reasoning && quirks.supports_reasoning).then(|| GeminiThinkingConfig {
            include_thoughts: true,
            thinking_budget: request.reasoning_budget_tokens,
        });

        GeminiGenerationConfig {
            temperature: quirks.temperature(request.temperature),
            max_output_tokens: request.max_tokens,
            thinking_config,
        }
    }

    fn build_request(&self, request: &ChatRequest) -> GeminiRequest {
        let (system_instruction, contents) = convert_messages(&request.messages);
        GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(self.generation_config(request)),
        }
    }

    async fn generate(&self, ctx: &CallContext<'_>, model: &str, body: &GeminiRequest) -> Result<ChatResponse> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .post(self.model_url(model, "generateContent"))
            .header("x-goog-api-key", api_key)
            .timeout(self.settings.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let parsed: GeminiResponse = ctx.parse_json(response).await?;
        let mut converter = GeminiStreamConverter::default();
        let mut transcript = Transcript::default();
        for fragment in converter.on_response(parsed)? {
            transcript.push(&fragment);
        }
        if transcript.content().is_empty() && converter.finish_reason.as_deref() == Some("SAFETY") {
            return Err(ctx.failure("Response blocked by safety filters"));
        }

        let mut result = transcript.into_response(PROVIDER_NAME, model);
        result.usage = converter.usage;
        result.finish_reason = converter.finish_reason;
        Ok(result)
    }

    async fn download(&self, ctx: &CallContext<'_>, uri: &str) -> Result<Vec<u8>> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .get(uri)
            .header("x-goog-api-key", api_key)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;
        ctx.bytes(response).await
    }
}

/// System turns become `systemInstruction`; assistant turns use the `model` role.
fn convert_messages(messages: &[Message]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::System => system_parts.push(GeminiPart::text(&message.content)),
            MessageRole::User => contents.push(GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart::text(&message.content)],
            }),
            MessageRole::Assistant => contents.push(GeminiContent {
                role: Some("model".to_string()),
                parts: vec![GeminiPart::text(&message.content)],
            }),
        }
    }

    let system = (!system_parts.is_empty()).then_some(GeminiContent {
        role: None,
        parts: system_parts,
    });
    (system, contents)
}

#[async_trait]
impl ProviderInfo for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_model(&self, capability: Capability) -> Option<&str> {
        self.settings.default_model(capability).or(match capability {
            Capability::Chat | Capability::Vision => Some("gemini-2.5-flash"),
            Capability::Embeddings => Some("text-embedding-004"),
            Capability::VideoGeneration => Some("veo-3.0-generate-001"),
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
                    self.client
                        .get(self.settings.url("models"))
                        .header("x-goog-api-key", api_key)
                        .timeout(self.settings.timeout),
                )
                .await
            }
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }
}

impl Provider for GeminiProvider {
    fn register(self: Arc<Self>, registry: &mut ProviderRegistry) {
        registry.add_descriptor(self.clone());
        registry.add_chat(self.clone());
        registry.add_vision(self.clone());
        registry.add_embeddings(self.clone());
        registry.add_video_generation(self);
    }
}

#[async_trait]
impl ChatCapability for GeminiProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.api_key()?;
        request.validate()?;
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, request.prompt_preview());
        let body = self.build_request(request);
        self.generate(&ctx, &request.model, &body).await
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
        let body = self.build_request(request);
        debug!("Starting streaming request to Gemini: model={}", request.model);

        let response = self
            .client
            .post(self.model_url(&request.model, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", api_key)
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
    let mut converter = GeminiStreamConverter::default();
    let mut transcript = Transcript::default();

    // No terminal marker: the stream ends with the body
    let end = read_sse(source, PROVIDER_NAME, cancel, |event| {
        for fragment in converter.on_event(&event)? {
            transcript.push(&fragment);
            on_fragment(fragment);
        }
        Ok(StreamControl::Continue)
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

/// Converts `GenerateContentResponse` objects; parts flagged `thought` are reasoning.
#[derive(Debug, Default)]
pub(crate) struct GeminiStreamConverter {
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl GeminiStreamConverter {
    pub fn on_event(&mut self, event: &Event) -> Result<Vec<StreamFragment>> {
        let parsed = serde_json::from_str::<GeminiResponse>(&event.data).map_err(|e| {
            warn!("Malformed Gemini stream chunk: {} (data: {})", e, event.data);
            Error::backend(PROVIDER_NAME, format!("Malformed stream chunk: {}", e))
        })?;
        self.on_response(parsed)
    }

    fn on_response(&mut self, response: GeminiResponse) -> Result<Vec<StreamFragment>> {
        if let Some(error) = response.error {
            return Err(Error::backend(PROVIDER_NAME, format!("API error {}: {}", error.code, error.message)));
        }
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(Error::backend(PROVIDER_NAME, format!("Prompt blocked: {}", reason)));
        }
        if let Some(usage) = response.usage_metadata {
            self.usage = Some(TokenUsage::new(usage.prompt_token_count, usage.candidates_token_count));
        }

        let mut fragments = Vec::new();
        if let Some(candidate) = response.candidates.into_iter().next() {
            if candidate.finish_reason.is_some() {
                self.finish_reason = candidate.finish_reason;
            }
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                match part.text {
                    Some(text) if text.is_empty() => {}
                    Some(text) if part.thought => fragments.push(StreamFragment::Reasoning(text)),
                    Some(text) => fragments.push(StreamFragment::Content(text)),
                    None => {}
                }
            }
        }
        Ok(fragments)
    }
}

#[async_trait]
impl VisionCapability for GeminiProvider {
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

        let mut parts: Vec<GeminiPart> = request
            .images
            .iter()
            .map(|image| GeminiPart {
                inline_data: Some(GeminiBlob {
                    mime_type: normalize_mime(&image.mime_type),
                    data: image.to_base64(),
                }),
                ..GeminiPart::default()
            })
            .collect();
        parts.push(GeminiPart::text(&request.prompt));

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts,
            }],
            system_instruction: None,
            generation_config: Some(GeminiGenerationConfig {
                temperature: quirks.temperature(request.temperature),
                max_output_tokens: request.max_tokens,
                thinking_config: None,
            }),
        };
        self.generate(&ctx, &request.model, &body).await
    }
}

#[async_trait]
impl EmbeddingCapability for GeminiProvider {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let api_key = self.api_key()?;
        if request.input.is_empty() {
            return Err(Error::invalid_request("Embedding input is empty"));
        }
        let preview = request.input.first().map(String::as_str).unwrap_or_default();
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, preview);
        let model = request.model.strip_prefix("models/").unwrap_or(&request.model);
        let model_path = format!("models/{}", model);

        let body = GeminiBatchEmbedRequest {
            requests: request
                .input
                .iter()
                .map(|text| GeminiEmbedRequest {
                    model: model_path.clone(),
                    content: GeminiContent {
                        role: None,
                        parts: vec![GeminiPart::text(text)],
                    },
                    output_dimensionality: request.dimensions,
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.model_url(model, "batchEmbedContents"))
            .header("x-goog-api-key", api_key)
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let parsed: GeminiBatchEmbedResponse = ctx.parse_json(response).await?;
        if parsed.embeddings.len() != request.input.len() {
            return Err(ctx.failure(format!(
                "Expected {} embeddings, received {}",
                request.input.len(),
                parsed.embeddings.len()
            )));
        }

        Ok(EmbeddingResponse {
            provider: PROVIDER_NAME.to_string(),
            model: model.to_string(),
            embeddings: parsed.embeddings.into_iter().map(|e| e.values).collect(),
            usage: None,
        })
    }
}

#[async_trait]
impl VideoGeneration for GeminiProvider {
    async fn submit_video(&self, request: &VideoRequest) -> Result<OperationHandle> {
        let api_key = self.api_key()?;
        if request.prompt.trim().is_empty() {
            return Err(Error::invalid_request("Video prompt is empty"));
        }
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, &request.prompt);

        let body = GeminiVideoRequest {
            instances: vec![GeminiVideoInstance {
                prompt: &request.prompt,
                negative_prompt: request.negative_prompt.as_deref(),
            }],
            parameters: GeminiVideoParameters {
                aspect_ratio: request.aspect_ratio.as_deref(),
                duration_seconds: request.duration_seconds,
            },
        };

        let response = self
            .client
            .post(self.model_url(&request.model, "predictLongRunning"))
            .header("x-goog-api-key", api_key)
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let operation: GeminiOperation = ctx.parse_json(response).await?;
        info!("Submitted Gemini video operation {}", operation.name);
        Ok(OperationHandle::new(PROVIDER_NAME, request.model.clone(), operation.name))
    }

    async fn poll_video(&self, handle: &OperationHandle) -> Result<OperationStatus<MediaResponse>> {
        let api_key = self.api_key()?;
        let ctx = CallContext::new(PROVIDER_NAME, &handle.model, &handle.id);

        let response = self
            .client
            .get(self.settings.url(&handle.id))
            .header("x-goog-api-key", api_key)
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;
        let operation: GeminiOperation = ctx.parse_json(response).await?;

        if !operation.done {
            return Ok(OperationStatus::Pending);
        }
        if let Some(error) = operation.error {
            warn!("Gemini video operation {} failed: {}", handle.id, error.message);
            return Ok(OperationStatus::Failed(Error::backend(
                PROVIDER_NAME,
                format!("Video generation failed: {}", error.message),
            )));
        }

        let result = operation
            .response
            .and_then(|r| r.generate_video_response)
            .unwrap_or_default();
        if result.generated_samples.is_empty() {
            let reason = if result.rai_media_filtered_reasons.is_empty() {
                "no samples returned".to_string()
            } else {
                format!("filtered: {}", result.rai_media_filtered_reasons.join("; "))
            };
            warn!("Gemini video operation {} produced nothing: {}", handle.id, reason);
            return Ok(OperationStatus::Failed(Error::backend(
                PROVIDER_NAME,
                format!("Video generation returned no video ({})", reason),
            )));
        }

        let mut items = Vec::with_capacity(result.generated_samples.len());
        for sample in result.generated_samples {
            let uri = sample
                .video
                .and_then(|v| v.uri)
                .ok_or_else(|| ctx.failure("Generated sample has no download URI"))?;
            let bytes = self.download(&ctx, &uri).await?;
            items.push(MediaDescriptor::inline("video/mp4", &bytes));
        }

        Ok(OperationStatus::Ready(MediaResponse {
            provider: PROVIDER_NAME.to_string(),
            model: handle.model.clone(),
            items,
        }))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiBlob>,
}

impl GeminiPart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    include_thoughts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct GeminiBatchEmbedRequest {
    requests: Vec<GeminiEmbedRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiBatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct GeminiVideoRequest<'a> {
    instances: Vec<GeminiVideoInstance<'a>>,
    parameters: GeminiVideoParameters<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiVideoInstance<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiVideoParameters<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiOperation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<GeminiError>,
    response: Option<GeminiOperationResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiOperationResponse {
    generate_video_response: Option<GeminiVideoResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiVideoResult {
    #[serde(default)]
    generated_samples: Vec<GeminiVideoSample>,
    #[serde(default)]
    rai_media_filtered_reasons: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiVideoSample {
    video: Option<GeminiVideoFile>,
}

#[derive(Debug, Deserialize)]
struct GeminiVideoFile {
    uri: Option<String>,
}
