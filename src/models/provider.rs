use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::operation::{OperationHandle, OperationStatus};
use crate::models::registry::ProviderRegistry;
use crate::models::types::{
    Capability, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, HealthStatus,
    ImageRequest, MediaResponse, SpeechRequest, StreamFragment, TranscriptionRequest,
    TranscriptionResponse, VideoRequest, VisionRequest,
};

/// Receives fragments in order while a stream is read.
pub type FragmentCallback<'a> = &'a mut (dyn FnMut(StreamFragment) + Send);

/// Descriptor every backend exposes regardless of capabilities.
#[async_trait]
pub trait ProviderInfo: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn default_model(&self, capability: Capability) -> Option<&str>;

    /// Whether the provider can be called at all (credentials, base URL).
    fn is_available(&self) -> bool;

    async fn get_status(&self) -> HealthStatus;

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Adapters register themselves into the capability lists they implement.
pub trait Provider: ProviderInfo + 'static {
    fn register(self: Arc<Self>, registry: &mut ProviderRegistry);
}

#[async_trait]
pub trait ChatCapability: ProviderInfo {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Streams fragments through `on_fragment` and returns the assembled response.
    /// Cancelling `cancel` stops reading between chunks and returns what was
    /// received so far without an error.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_fragment: FragmentCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse>;
}

#[async_trait]
pub trait VisionCapability: ProviderInfo {
    async fn describe_image(&self, request: &VisionRequest) -> Result<ChatResponse>;
}

#[async_trait]
pub trait EmbeddingCapability: ProviderInfo {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse>;
}

#[async_trait]
pub trait ImageGeneration: ProviderInfo {
    async fn generate_image(&self, request: &ImageRequest) -> Result<MediaResponse>;
}

#[async_trait]
pub trait VideoGeneration: ProviderInfo {
    async fn submit_video(&self, request: &VideoRequest) -> Result<OperationHandle>;

    /// Status of a submitted job. On completion the result is fetched and inlined.
    async fn poll_video(&self, handle: &OperationHandle) -> Result<OperationStatus<MediaResponse>>;
}

#[async_trait]
pub trait SpeechToText: ProviderInfo {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<TranscriptionResponse>;
}

#[async_trait]
pub trait TextToSpeech: ProviderInfo {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<MediaResponse>;
}

/// Shorten user text for log lines.
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}…", truncated)
    } else {
        truncated
    }
}
