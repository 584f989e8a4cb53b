use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::http::{build_client, probe, AdapterSettings, CallContext};
use crate::models::provider::{ChatCapability, EmbeddingCapability, FragmentCallback, Provider, ProviderInfo};
use crate::models::registry::ProviderRegistry;
use crate::models::streaming::{read_lines, ChunkSource, StreamControl, StreamEnd};
use crate::models::types::{
    Capability, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, HealthStatus, Message,
    StreamFragment, TokenUsage, Transcript,
};

pub const PROVIDER_NAME: &str = "ollama";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

const CAPABILITIES: &[Capability] = &[Capability::Chat, Capability::Embeddings];

/// Adapter for a local or hosted Ollama server. An API key is optional.
pub struct OllamaProvider {
    client: Client,
    settings: AdapterSettings,
}

impl OllamaProvider {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let client = build_client(PROVIDER_NAME, &settings)?;
        Ok(Self { client, settings })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.settings.url(path));
        match &self.settings.api_key {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OllamaChatRequest {
        let quirks = self.settings.quirks_for(PROVIDER_NAME, &request.model);
        OllamaChatRequest {
            model: request.model.clone(),
            messages: convert_messages(&request.messages),
            stream,
            think: (request.reasoning && quirks.supports_reasoning).then_some(true),
            options: OllamaOptions {
                temperature: quirks.temperature(request.temperature),
                num_predict: request.max_tokens,
            },
        }
    }
}

fn convert_messages(messages: &[Message]) -> Vec<OllamaMessage> {
    messages
        .iter()
        .map(|msg| OllamaMessage {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        })
        .collect()
}

#[async_trait]
impl ProviderInfo for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_model(&self, capability: Capability) -> Option<&str> {
        self.settings.default_model(capability).or(match capability {
            Capability::Chat => Some("llama3.2"),
            Capability::Embeddings => Some("nomic-embed-text"),
            _ => None,
        })
    }

    fn is_available(&self) -> bool {
        !self.settings.base_url.trim().is_empty()
    }

    async fn get_status(&self) -> HealthStatus {
        let builder = self
            .client
            .get(self.settings.url("api/tags"))
            .timeout(self.settings.timeout);
        let builder = match &self.settings.api_key {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        };
        probe(builder).await
    }
}

impl Provider for OllamaProvider {
    fn register(self: Arc<Self>, registry: &mut ProviderRegistry) {
        registry.add_descriptor(self.clone());
        registry.add_chat(self.clone());
        registry.add_embeddings(self);
    }
}

#[async_trait]
impl ChatCapability for OllamaProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        request.validate()?;
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, request.prompt_preview());
        let body = self.build_request(request, false);

        let response = self
            .post("api/chat")
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;
        let chunk: OllamaChatChunk = ctx.parse_json(response).await?;

        let mut converter = OllamaStreamConverter::default();
        let mut transcript = Transcript::default();
        for fragment in converter.on_chunk(chunk)? {
            transcript.push(&fragment);
        }

        let mut result = transcript.into_response(PROVIDER_NAME, &request.model);
        result.usage = converter.usage;
        result.finish_reason = converter.done_reason;
        Ok(result)
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_fragment: FragmentCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        request.validate()?;
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, request.prompt_preview());
        let body = self.build_request(request, true);
        debug!("Starting streaming request to Ollama: model={}", request.model);

        let response = self
            .post("api/chat")
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
    let mut converter = OllamaStreamConverter::default();
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
        StreamEnd::Finished => converter.done_reason,
    };
    Ok(response)
}

/// Newline-delimited JSON objects; the one with `done: true` ends the stream.
#[derive(Debug, Default)]
pub(crate) struct OllamaStreamConverter {
    pub done: bool,
    pub done_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl OllamaStreamConverter {
    pub fn on_line(&mut self, line: &str) -> Result<Vec<StreamFragment>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let chunk: OllamaChatChunk = serde_json::from_str(line)
            .map_err(|e| Error::backend(PROVIDER_NAME, format!("Malformed stream chunk: {}", e)))?;
        self.on_chunk(chunk)
    }

    fn on_chunk(&mut self, chunk: OllamaChatChunk) -> Result<Vec<StreamFragment>> {
        if let Some(error) = chunk.error {
            return Err(Error::backend(PROVIDER_NAME, error));
        }

        let mut fragments = Vec::new();
        if let Some(message) = chunk.message {
            if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
                fragments.push(StreamFragment::Reasoning(thinking));
            }
            if !message.content.is_empty() {
                fragments.push(StreamFragment::Content(message.content));
            }
        }

        if chunk.done {
            self.done = true;
            self.done_reason = chunk.done_reason;
            if chunk.prompt_eval_count.is_some() || chunk.eval_count.is_some() {
                self.usage = Some(TokenUsage::new(
                    chunk.prompt_eval_count.unwrap_or(0),
                    chunk.eval_count.unwrap_or(0),
                ));
            }
        }
        Ok(fragments)
    }
}

#[async_trait]
impl EmbeddingCapability for OllamaProvider {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        if request.input.is_empty() {
            return Err(Error::invalid_request("Embedding input is empty"));
        }
        let preview = request.input.first().map(String::as_str).unwrap_or_default();
        let ctx = CallContext::new(PROVIDER_NAME, &request.model, preview);

        let body = OllamaEmbedRequest {
            model: &request.model,
            input: &request.input,
            dimensions: request.dimensions,
        };
        let response = self
            .post("api/embed")
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ctx.transport_error(e))?;

        let parsed: OllamaEmbedResponse = ctx.parse_json(response).await?;
        Ok(EmbeddingResponse {
            provider: PROVIDER_NAME.to_string(),
            model: request.model.clone(),
            embeddings: parsed.embeddings,
            usage: parsed.prompt_eval_count.map(|count| TokenUsage::new(count, 0)),
        })
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    thinking: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
    prompt_eval_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::streaming::ScriptedChunks;

    #[test]
    fn test_available_without_api_key() {
        let provider = OllamaProvider::new(AdapterSettings::new(DEFAULT_BASE_URL)).unwrap();
        assert!(provider.is_available());
        assert_eq!(provider.default_model(Capability::Chat), Some("llama3.2"));
        assert!(!provider.supports(Capability::Vision));
    }

    #[test]
    fn test_think_flag() {
        let provider = OllamaProvider::new(AdapterSettings::new(DEFAULT_BASE_URL)).unwrap();
        let request = ChatRequest::new(vec![Message::user("hi")], "deepseek-r1:8b")
            .with_reasoning(None)
            .with_max_tokens(64);
        let body = serde_json::to_value(provider.build_request(&request, true)).unwrap();
        assert_eq!(body["think"], true);
        assert_eq!(body["options"]["num_predict"], 64);

        let request = ChatRequest::new(vec![Message::user("hi")], "llama3.2").with_reasoning(None);
        let body = serde_json::to_value(provider.build_request(&request, true)).unwrap();
        assert!(body.get("think").is_none());
    }

    #[tokio::test]
    async fn test_ndjson_stream() {
        let mut source = ScriptedChunks::new([
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\",\"thinking\":\"hmm\"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\"Hel",
            "lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":7,\"eval_count\":3}\n",
        ]);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let mut on_fragment = |fragment: StreamFragment| seen.push(fragment);

        let response = consume_stream(&mut source, "deepseek-r1:8b", &mut on_fragment, &cancel)
            .await
            .unwrap();

        assert_eq!(
            seen,
            vec![
                StreamFragment::Reasoning("hmm".into()),
                StreamFragment::Content("Hello".into())
            ]
        );
        assert_eq!(response.content, "Hello");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage, Some(TokenUsage::new(7, 3)));
    }

    #[test]
    fn test_error_object() {
        let mut converter = OllamaStreamConverter::default();
        let err = converter.on_line(r#"{"error":"model 'x' not found"}"#).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(converter.on_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_truncated_object_fails_the_stream() {
        let mut source = ScriptedChunks::new([
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\" wor\n",
            "{\"done\":true}\n",
        ]);
        let cancel = CancellationToken::new();
        let mut on_fragment = |_: StreamFragment| {};

        let result = consume_stream(&mut source, "llama3.2", &mut on_fragment, &cancel).await;
        assert!(matches!(result, Err(Error::Backend { .. })));
    }
}
