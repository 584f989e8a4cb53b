pub mod anthropic;
pub mod capability_detection;
pub mod circuit_breaker;
pub mod gemini;
pub mod http;
pub mod media;
pub mod ollama;
pub mod openai;
pub mod operation;
pub mod provider;
pub mod rate_limiter;
pub mod registry;
pub mod selector;
pub mod streaming;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use capability_detection::{ModelQuirks, QuirkTable, TokenLimitParam};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use gemini::GeminiProvider;
pub use http::AdapterSettings;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;
pub use operation::{OperationHandle, OperationStatus, PollPolicy};
pub use provider::{
    ChatCapability, EmbeddingCapability, FragmentCallback, ImageGeneration, Provider, ProviderInfo,
    SpeechToText, TextToSpeech, VideoGeneration, VisionCapability,
};
pub use rate_limiter::{
    ActionCeilings, CeilingSource, QuotaCheck, QuotaEnforcer, QuotaSettings, QuotaStrategy, QuotaType,
    StaticCeilings, TierPolicy,
};
pub use registry::ProviderRegistry;
pub use selector::{ModelCatalog, ModelRanking, ModelSelector, ModelTag, PricingInfo, StaticCatalog};
pub use types::{
    BinaryPayload, CallOptions, Capability, ChatRequest, ChatResponse, EmbeddingRequest,
    EmbeddingResponse, HealthStatus, ImageRequest, MediaDescriptor, MediaResponse, Message,
    MessageRole, SpeechRequest, StreamFragment, TimeoutClass, TokenUsage, TranscriptionRequest,
    TranscriptionResponse, VideoRequest, VisionRequest,
};
