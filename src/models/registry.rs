use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::models::provider::{
    ChatCapability, EmbeddingCapability, ImageGeneration, Provider, ProviderInfo, SpeechToText,
    TextToSpeech, VideoGeneration, VisionCapability,
};
use crate::models::types::Capability;

/// Capability → adapter lists, built once at startup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    descriptors: BTreeMap<String, Arc<dyn ProviderInfo>>,
    chat: BTreeMap<String, Arc<dyn ChatCapability>>,
    vision: BTreeMap<String, Arc<dyn VisionCapability>>,
    embeddings: BTreeMap<String, Arc<dyn EmbeddingCapability>>,
    image: BTreeMap<String, Arc<dyn ImageGeneration>>,
    video: BTreeMap<String, Arc<dyn VideoGeneration>>,
    speech_to_text: BTreeMap<String, Arc<dyn SpeechToText>>,
    text_to_speech: BTreeMap<String, Arc<dyn TextToSpeech>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Provider>(&mut self, provider: Arc<P>) {
        info!(
            "Registering provider {} (available: {}, capabilities: {:?})",
            provider.name(),
            provider.is_available(),
            provider.capabilities()
        );
        provider.register(self);
    }

    pub fn add_descriptor(&mut self, provider: Arc<dyn ProviderInfo>) {
        self.descriptors.insert(provider.name().to_string(), provider);
    }

    pub fn add_chat(&mut self, provider: Arc<dyn ChatCapability>) {
        self.chat.insert(provider.name().to_string(), provider);
    }

    pub fn add_vision(&mut self, provider: Arc<dyn VisionCapability>) {
        self.vision.insert(provider.name().to_string(), provider);
    }

    pub fn add_embeddings(&mut self, provider: Arc<dyn EmbeddingCapability>) {
        self.embeddings.insert(provider.name().to_string(), provider);
    }

    pub fn add_image_generation(&mut self, provider: Arc<dyn ImageGeneration>) {
        self.image.insert(provider.name().to_string(), provider);
    }

    pub fn add_video_generation(&mut self, provider: Arc<dyn VideoGeneration>) {
        self.video.insert(provider.name().to_string(), provider);
    }

    pub fn add_speech_to_text(&mut self, provider: Arc<dyn SpeechToText>) {
        self.speech_to_text.insert(provider.name().to_string(), provider);
    }

    pub fn add_text_to_speech(&mut self, provider: Arc<dyn TextToSpeech>) {
        self.text_to_speech.insert(provider.name().to_string(), provider);
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<dyn ProviderInfo>> {
        self.descriptors.get(name).cloned()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<dyn ProviderInfo>> {
        self.descriptors.values()
    }

    /// Provider names registered for a capability, sorted.
    pub fn providers_for(&self, capability: Capability) -> Vec<&str> {
        let names: Vec<&String> = match capability {
            Capability::Chat => self.chat.keys().collect(),
            Capability::Vision => self.vision.keys().collect(),
            Capability::Embeddings => self.embeddings.keys().collect(),
            Capability::ImageGeneration => self.image.keys().collect(),
            Capability::VideoGeneration => self.video.keys().collect(),
            Capability::SpeechToText => self.speech_to_text.keys().collect(),
            Capability::TextToSpeech => self.text_to_speech.keys().collect(),
        };
        names.into_iter().map(String::as_str).collect()
    }

    pub fn chat(&self, name: &str) -> Result<Arc<dyn ChatCapability>> {
        lookup(&self.chat, name, Capability::Chat)
    }

    pub fn vision(&self, name: &str) -> Result<Arc<dyn VisionCapability>> {
        lookup(&self.vision, name, Capability::Vision)
    }

    pub fn embeddings(&self, name: &str) -> Result<Arc<dyn EmbeddingCapability>> {
        lookup(&self.embeddings, name, Capability::Embeddings)
    }

    pub fn image_generation(&self, name: &str) -> Result<Arc<dyn ImageGeneration>> {
        lookup(&self.image, name, Capability::ImageGeneration)
    }

    pub fn video_generation(&self, name: &str) -> Result<Arc<dyn VideoGeneration>> {
        lookup(&self.video, name, Capability::VideoGeneration)
    }

    pub fn speech_to_text(&self, name: &str) -> Result<Arc<dyn SpeechToText>> {
        lookup(&self.speech_to_text, name, Capability::SpeechToText)
    }

    pub fn text_to_speech(&self, name: &str) -> Result<Arc<dyn TextToSpeech>> {
        lookup(&self.text_to_speech, name, Capability::TextToSpeech)
    }
}

fn lookup<T: ?Sized>(map: &BTreeMap<String, Arc<T>>, name: &str, capability: Capability) -> Result<Arc<T>> {
    map.get(name).cloned().ok_or_else(|| {
        Error::invalid_request(format!(
            "Provider '{}' does not support {}",
            name, capability
        ))
    })
}
