//! Model ranking and the "Again" retry prediction.

use std::fmt;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::{Capability, TokenUsage};

/// Fixed intent tags that models are ranked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelTag {
    Chat,
    Code,
    Reasoning,
    Vision,
    ImageGeneration,
    VideoGeneration,
    SpeechToText,
    TextToSpeech,
    Embedding,
}

impl ModelTag {
    pub const ALL: [ModelTag; 9] = [
        ModelTag::Chat,
        ModelTag::Code,
        ModelTag::Reasoning,
        ModelTag::Vision,
        ModelTag::ImageGeneration,
        ModelTag::VideoGeneration,
        ModelTag::SpeechToText,
        ModelTag::TextToSpeech,
        ModelTag::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTag::Chat => "chat",
            ModelTag::Code => "code",
            ModelTag::Reasoning => "reasoning",
            ModelTag::Vision => "vision",
            ModelTag::ImageGeneration => "image-generation",
            ModelTag::VideoGeneration => "video-generation",
            ModelTag::SpeechToText => "speech-to-text",
            ModelTag::TextToSpeech => "text-to-speech",
            ModelTag::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Capability that executes requests under this tag.
    pub fn capability(&self) -> Capability {
        match self {
            ModelTag::Chat | ModelTag::Code | ModelTag::Reasoning => Capability::Chat,
            ModelTag::Vision => Capability::Vision,
            ModelTag::ImageGeneration => Capability::ImageGeneration,
            ModelTag::VideoGeneration => Capability::VideoGeneration,
            ModelTag::SpeechToText => Capability::SpeechToText,
            ModelTag::TextToSpeech => Capability::TextToSpeech,
            ModelTag::Embedding => Capability::Embeddings,
        }
    }
}

impl fmt::Display for ModelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingInfo {
    pub input_per_1k_tokens: Decimal,
    pub output_per_1k_tokens: Decimal,
}

impl PricingInfo {
    pub fn cost(&self, usage: &TokenUsage) -> Decimal {
        let thousand = Decimal::from(1000);
        Decimal::from(usage.input_tokens) * self.input_per_1k_tokens / thousand
            + Decimal::from(usage.output_tokens) * self.output_per_1k_tokens / thousand
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRanking {
    pub model_id: String,
    /// Provider that serves the model.
    pub service: String,
    pub quality: u32,
    pub rating: f64,
    #[serde(default)]
    pub tags: Vec<ModelTag>,
    #[serde(default)]
    pub pricing: Option<PricingInfo>,
}

pub trait ModelCatalog: Send + Sync {
    fn rankings(&self) -> Arc<Vec<ModelRanking>>;

    fn find(&self, model_id: &str) -> Option<ModelRanking> {
        self.rankings().iter().find(|r| r.model_id == model_id).cloned()
    }
}

/// Catalog held in memory, swapped atomically on reload.
pub struct StaticCatalog {
    rankings: ArcSwap<Vec<ModelRanking>>,
}

impl StaticCatalog {
    pub fn new(rankings: Vec<ModelRanking>) -> Self {
        Self {
            rankings: ArcSwap::from_pointee(rankings),
        }
    }

    pub fn replace(&self, rankings: Vec<ModelRanking>) {
        info!("Model catalog replaced with {} entries", rankings.len());
        self.rankings.store(Arc::new(rankings));
    }
}

impl ModelCatalog for StaticCatalog {
    fn rankings(&self) -> Arc<Vec<ModelRanking>> {
        self.rankings.load_full()
    }
}

pub struct ModelSelector {
    catalog: Arc<dyn ModelCatalog>,
}

impl ModelSelector {
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<dyn ModelCatalog> {
        &self.catalog
    }

    /// Models tagged `tag`, best first: quality desc, rating desc, id asc.
    pub fn eligible(&self, tag: ModelTag, min_rating: Option<f64>) -> Vec<ModelRanking> {
        let rankings = self.catalog.rankings();
        let mut eligible: Vec<ModelRanking> = rankings
            .iter()
            .filter(|r| r.tags.contains(&tag))
            .filter(|r| min_rating.map_or(true, |floor| r.rating >= floor))
            .cloned()
            .collect();

        eligible.sort_by(|a, b| {
            b.quality
                .cmp(&a.quality)
                .then_with(|| b.rating.total_cmp(&a.rating))
                .then_with(|| a.model_id.cmp(&b.model_id))
        });

        debug!("{} eligible models for tag {}", eligible.len(), tag);
        eligible
    }

    pub fn pricing(&self, model_id: &str) -> Option<PricingInfo> {
        self.catalog.find(model_id).and_then(|r| r.pricing)
    }

    /// Provider serving `model_id` according to the catalog.
    pub fn service_for(&self, model_id: &str) -> Option<String> {
        self.catalog.find(model_id).map(|r| r.service)
    }
}

/// The model to try after `current`, wrapping around to the first.
pub fn predicted_next<'a>(eligible: &'a [ModelRanking], current: Option<&str>) -> Option<&'a ModelRanking> {
    let position = current.and_then(|id| eligible.iter().position(|r| r.model_id == id));
    match position {
        Some(index) if index + 1 < eligible.len() => eligible.get(index + 1),
        _ => eligible.first(),
    }
}

fn tag_patterns() -> &'static [(ModelTag, Regex)] {
    static PATTERNS: OnceLock<Vec<(ModelTag, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (ModelTag::Embedding, r"\b(embed(ding)?s?|vectori[sz]e|semantic search)\b"),
            (ModelTag::VideoGeneration, r"\b(video|animation|animate|movie clip)\b"),
            (
                ModelTag::ImageGeneration,
                r"\b(generate|create|draw|paint|render|design|make)\b.*\b(image|picture|illustration|logo|art|drawing)s?\b|\btext[- ]to[- ]image\b|\bimage generation\b",
            ),
            (ModelTag::SpeechToText, r"\b(transcri(be|ption)|speech[- ]to[- ]text|dictation|stt)\b"),
            (ModelTag::TextToSpeech, r"\b(text[- ]to[- ]speech|tts|read (it )?aloud|narrat(e|ion)|voice ?over)\b"),
            (ModelTag::Vision, r"\b(image|photo|picture|screenshot|diagram|vision|ocr)s?\b"),
            (
                ModelTag::Code,
                r"\b(code|coding|program(ming)?|debug|refactor|compile[rd]?|function|rust|python|javascript|typescript|sql)\b",
            ),
            (ModelTag::Reasoning, r"\b(reason(ing)?|math(s|ematics)?|logic|proof|puzzle|step[- ]by[- ]step|analy[sz]e)\b"),
        ]
        .into_iter()
        .filter_map(|(tag, pattern)| Regex::new(pattern).ok().map(|re| (tag, re)))
        .collect()
    })
}

/// Map a free-form topic onto a tag. Unrecognised topics fall back to chat.
pub fn resolve_tag(topic: &str) -> ModelTag {
    if let Some(tag) = ModelTag::parse(topic) {
        return tag;
    }

    let topic = topic.to_lowercase();
    tag_patterns()
        .iter()
        .find(|(_, re)| re.is_match(&topic))
        .map(|(tag, _)| *tag)
        .unwrap_or(ModelTag::Chat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking(id: &str, quality: u32, rating: f64, tags: &[ModelTag]) -> ModelRanking {
        ModelRanking {
            model_id: id.to_string(),
            service: "openai".to_string(),
            quality,
            rating,
            tags: tags.to_vec(),
            pricing: None,
        }
    }

    fn selector() -> ModelSelector {
        ModelSelector::new(Arc::new(StaticCatalog::new(vec![
            ranking("b-model", 90, 4.5, &[ModelTag::Chat]),
            ranking("a-model", 90, 4.5, &[ModelTag::Chat, ModelTag::Code]),
            ranking("c-model", 95, 3.0, &[ModelTag::Chat]),
            ranking("d-model", 90, 4.8, &[ModelTag::Chat]),
            ranking("painter", 80, 4.0, &[ModelTag::ImageGeneration]),
        ])))
    }

    fn ids(rankings: &[ModelRanking]) -> Vec<&str> {
        rankings.iter().map(|r| r.model_id.as_str()).collect()
    }

    #[test]
    fn test_eligible_ordering() {
        let eligible = selector().eligible(ModelTag::Chat, None);
        assert_eq!(ids(&eligible), vec!["c-model", "d-model", "a-model", "b-model"]);
    }

    #[test]
    fn test_eligible_rating_floor() {
        let eligible = selector().eligible(ModelTag::Chat, Some(4.5));
        assert_eq!(ids(&eligible), vec!["d-model", "a-model", "b-model"]);
        assert!(selector().eligible(ModelTag::Vision, None).is_empty());
    }

    #[test]
    fn test_predicted_next_wraps() {
        let list = vec![
            ranking("A", 3, 1.0, &[ModelTag::Chat]),
            ranking("B", 2, 1.0, &[ModelTag::Chat]),
            ranking("C", 1, 1.0, &[ModelTag::Chat]),
        ];

        let next = |current: Option<&str>| predicted_next(&list, current).map(|r| r.model_id.clone());
        assert_eq!(next(Some("B")).as_deref(), Some("C"));
        assert_eq!(next(Some("C")).as_deref(), Some("A"));
        assert_eq!(next(None).as_deref(), Some("A"));
        assert_eq!(next(Some("unknown")).as_deref(), Some("A"));
        // Same input, same answer
        assert_eq!(next(Some("B")), next(Some("B")));
        assert!(predicted_next(&[], Some("A")).is_none());
    }

    #[test]
    fn test_resolve_tag() {
        assert_eq!(resolve_tag("code"), ModelTag::Code);
        assert_eq!(resolve_tag("IMAGE_GENERATION"), ModelTag::ImageGeneration);
        assert_eq!(resolve_tag("Help me debug this Rust function"), ModelTag::Code);
        assert_eq!(resolve_tag("Draw a picture of a lighthouse"), ModelTag::ImageGeneration);
        assert_eq!(resolve_tag("What is in this photo?"), ModelTag::Vision);
        assert_eq!(resolve_tag("Transcribe this meeting"), ModelTag::SpeechToText);
        assert_eq!(resolve_tag("Solve this math puzzle step by step"), ModelTag::Reasoning);
        assert_eq!(resolve_tag("tell me a joke"), ModelTag::Chat);
        assert_eq!(resolve_tag(""), ModelTag::Chat);
    }

    #[test]
    fn test_tag_capability() {
        assert_eq!(ModelTag::Code.capability(), Capability::Chat);
        assert_eq!(ModelTag::Embedding.capability(), Capability::Embeddings);
        assert_eq!(ModelTag::VideoGeneration.capability(), Capability::VideoGeneration);
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = PricingInfo {
            input_per_1k_tokens: Decimal::new(15, 5),  // 0.00015
            output_per_1k_tokens: Decimal::new(60, 5), // 0.00060
        };
        let cost = pricing.cost(&TokenUsage::new(2000, 1000));
        assert_eq!(cost, Decimal::new(90, 5));
    }

    #[test]
    fn test_catalog_replace() {
        let catalog = Arc::new(StaticCatalog::new(vec![ranking("old", 1, 1.0, &[ModelTag::Chat])]));
        let selector = ModelSelector::new(catalog.clone());
        catalog.replace(vec![ranking("new", 1, 1.0, &[ModelTag::Chat])]);

        assert_eq!(ids(&selector.eligible(ModelTag::Chat, None)), vec!["new"]);
        assert_eq!(selector.service_for("new").as_deref(), Some("openai"));
        assert!(selector.service_for("old").is_none());
    }
}
