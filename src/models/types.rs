use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A named unit of AI functionality, independent of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Vision,
    Embeddings,
    ImageGeneration,
    VideoGeneration,
    SpeechToText,
    TextToSpeech,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Chat,
        Capability::Vision,
        Capability::Embeddings,
        Capability::ImageGeneration,
        Capability::VideoGeneration,
        Capability::SpeechToText,
        Capability::TextToSpeech,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Vision => "vision",
            Capability::Embeddings => "embeddings",
            Capability::ImageGeneration => "image_generation",
            Capability::VideoGeneration => "video_generation",
            Capability::SpeechToText => "speech_to_text",
            Capability::TextToSpeech => "text_to_speech",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Timeout budget class the capability belongs to.
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Capability::Chat | Capability::Vision | Capability::Embeddings => TimeoutClass::Text,
            Capability::ImageGeneration => TimeoutClass::Media,
            Capability::SpeechToText | Capability::TextToSpeech => TimeoutClass::Audio,
            Capability::VideoGeneration => TimeoutClass::LongRunning,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    Text,
    Media,
    Audio,
    LongRunning,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
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
}

/// Caller-supplied options shared by every capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub reasoning: bool,
    pub reasoning_budget_tokens: Option<u32>,
}

impl CallOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
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

    pub fn with_reasoning(mut self, budget_tokens: Option<u32>) -> Self {
        self.reasoning = true;
        self.reasoning_budget_tokens = budget_tokens;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub id: String,
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning: bool,
    pub reasoning_budget_tokens: Option<u32>,
    pub user_id: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            reasoning: false,
            reasoning_budget_tokens: None,
            user_id: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_reasoning(mut self, budget_tokens: Option<u32>) -> Self {
        self.reasoning = true;
        self.reasoning_budget_tokens = budget_tokens;
        self
    }

    pub fn apply_options(mut self, options: &CallOptions) -> Self {
        self.temperature = options.temperature;
        self.max_tokens = options.max_tokens;
        self.reasoning = options.reasoning;
        self.reasoning_budget_tokens = options.reasoning_budget_tokens;
        self
    }

    /// Latest user turn, used for log context.
    pub fn prompt_preview(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::invalid_request("A model is required"));
        }
        if self.messages.is_empty() {
            return Err(Error::invalid_request("At least one message is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatResponse {
    pub fn new(provider: &str, model: &str, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            content: content.into(),
            reasoning: None,
            usage: None,
            finish_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// One incremental piece of a streamed answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum StreamFragment {
    Content(String),
    Reasoning(String),
}

impl StreamFragment {
    pub fn text(&self) -> &str {
        match self {
            StreamFragment::Content(text) | StreamFragment::Reasoning(text) => text,
        }
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, StreamFragment::Reasoning(_))
    }
}

/// Accumulates streamed fragments into the final response body.
#[derive(Debug, Default)]
pub struct Transcript {
    content: String,
    reasoning: String,
}

impl Transcript {
    pub fn push(&mut self, fragment: &StreamFragment) {
        match fragment {
            StreamFragment::Content(text) => self.content.push_str(text),
            StreamFragment::Reasoning(text) => self.reasoning.push_str(text),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn into_response(self, provider: &str, model: &str) -> ChatResponse {
        let mut response = ChatResponse::new(provider, model, self.content);
        if !self.reasoning.is_empty() {
            response.reasoning = Some(self.reasoning);
        }
        response
    }
}

/// Raw bytes crossing the adapter boundary, tagged with their MIME type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl BinaryPayload {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionRequest {
    pub model: String,
    pub prompt: String,
    pub images: Vec<BinaryPayload>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub provider: String,
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub count: u32,
    pub size: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRequest {
    pub model: String,
    pub prompt: String,
    pub aspect_ratio: Option<String>,
    pub duration_seconds: Option<u32>,
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    pub model: String,
    pub audio: BinaryPayload,
    pub language: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub provider: String,
    pub model: String,
    pub text: String,
    pub language: Option<String>,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub text: String,
    pub voice: Option<String>,
    /// Output container, e.g. `mp3` or `wav`.
    pub format: Option<String>,
}

/// A generated artifact, inlined as base64 or referenced by URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaDescriptor {
    pub mime_type: String,
    pub data_base64: Option<String>,
    pub url: Option<String>,
    pub revised_prompt: Option<String>,
}

impl MediaDescriptor {
    pub fn inline(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data_base64: Some(BASE64.encode(bytes)),
            url: None,
            revised_prompt: None,
        }
    }

    pub fn decode(&self) -> Result<Option<Vec<u8>>> {
        self.data_base64
            .as_deref()
            .map(|data| {
                BASE64
                    .decode(data)
                    .map_err(|e| Error::invalid_request(format!("Invalid base64 payload: {}", e)))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaResponse {
    pub provider: String,
    pub model: String,
    pub items: Vec<MediaDescriptor>,
}

/// Health snapshot reported by a provider descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error_rate: Option<f64>,
    pub active_connections: Option<u32>,
    pub error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl HealthStatus {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            checked_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            error: Some(error.into()),
            checked_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_wire_shape() {
        let json = serde_json::to_value(StreamFragment::Reasoning("hmm".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "reasoning", "content": "hmm"}));

        let parsed: StreamFragment =
            serde_json::from_value(serde_json::json!({"type": "content", "content": "hi"})).unwrap();
        assert_eq!(parsed, StreamFragment::Content("hi".into()));
    }

    #[test]
    fn test_transcript_excludes_reasoning() {
        let mut transcript = Transcript::default();
        transcript.push(&StreamFragment::Reasoning("thinking...".into()));
        transcript.push(&StreamFragment::Content("Hello".into()));
        transcript.push(&StreamFragment::Content(", world".into()));

        let response = transcript.into_response("anthropic", "claude");
        assert_eq!(response.content, "Hello, world");
        assert_eq!(response.reasoning.as_deref(), Some("thinking..."));
    }

    #[test]
    fn test_capability_names() {
        for capability in Capability::ALL {
            assert_eq!(Capability::parse(capability.as_str()), Some(capability));
        }
        assert_eq!(Capability::VideoGeneration.timeout_class(), TimeoutClass::LongRunning);
    }

    #[test]
    fn test_chat_request_validation() {
        let request = ChatRequest::new(vec![Message::user("hi")], "");
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));

        let request = ChatRequest::new(vec![], "gpt-4o");
        assert!(request.validate().is_err());

        let request = ChatRequest::new(vec![Message::system("s"), Message::user("hi")], "gpt-4o");
        assert!(request.validate().is_ok());
        assert_eq!(request.prompt_preview(), "hi");
    }

    #[test]
    fn test_media_descriptor_inline() {
        let descriptor = MediaDescriptor::inline("image/png", b"\x89PNG");
        assert_eq!(descriptor.decode().unwrap().unwrap(), b"\x89PNG".to_vec());
        assert_eq!(BinaryPayload::new("image/png", vec![1, 2]).to_data_url(), "data:image/png;base64,AQI=");
    }
}
