use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use validator::Validate;

use crate::error::{Error, Result};
use crate::gateway::{ModelTarget, TimeoutBudgets};
use crate::models::{
    anthropic, gemini, ollama, openai, ActionCeilings, Capability, CircuitBreakerConfig, ModelQuirks,
    ModelRanking, ModelTag, PollPolicy, PricingInfo, QuotaSettings, QuotaStrategy, TierPolicy,
};
use crate::platform::AppPaths;

pub const KNOWN_PROVIDERS: [&str; 4] = [
    openai::PROVIDER_NAME,
    anthropic::PROVIDER_NAME,
    gemini::PROVIDER_NAME,
    ollama::PROVIDER_NAME,
];

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    pub providers: BTreeMap<String, ProviderConfig>,
    /// System default target per capability name.
    pub defaults: BTreeMap<String, ModelTarget>,
    #[validate(nested)]
    pub circuit_breaker: BreakerConfig,
    #[validate(nested)]
    pub quotas: QuotaConfig,
    #[validate(nested)]
    pub timeouts: TimeoutBudgets,
    #[validate(nested)]
    pub polling: PollingConfig,
    pub catalog: CatalogConfig,
    /// Parameter quirk overrides keyed by `provider:model`, `model` or `prefix*`.
    pub quirks: BTreeMap<String, ModelQuirks>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    /// Falls back to the provider's environment variable, then the OS keyring.
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    /// Per-capability default model, keyed by capability name.
    pub default_models: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            timeout_seconds: 60,
            default_models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BreakerConfig {
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub half_open_max_calls: u32,
    #[validate(range(min = 1))]
    pub state_ttl_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            timeout_seconds: defaults.timeout.as_secs(),
            half_open_max_calls: defaults.half_open_max_calls,
            state_ttl_seconds: defaults.state_ttl.as_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_seconds),
            half_open_max_calls: self.half_open_max_calls,
            state_ttl: Duration::from_secs(self.state_ttl_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QuotaConfig {
    #[validate(range(min = 1))]
    pub ceiling_cache_seconds: u64,
    /// Tier applied to CLI callers that do not name one.
    #[validate(length(min = 1))]
    pub default_tier: String,
    pub tiers: BTreeMap<String, TierPolicy>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let ceilings = |lifetime, hourly, monthly| ActionCeilings {
            lifetime,
            hourly,
            monthly,
        };

        let free = TierPolicy {
            strategy: QuotaStrategy::Lifetime,
            actions: BTreeMap::from([
                ("chat".to_string(), ceilings(Some(50), None, None)),
                ("image_generation".to_string(), ceilings(Some(5), None, None)),
            ]),
        };
        let pro = TierPolicy {
            strategy: QuotaStrategy::Rolling,
            actions: BTreeMap::from([
                ("chat".to_string(), ceilings(None, Some(100), Some(5000))),
                ("image_generation".to_string(), ceilings(None, Some(20), Some(300))),
                ("video_generation".to_string(), ceilings(None, Some(2), Some(30))),
            ]),
        };

        Self {
            ceiling_cache_seconds: QuotaSettings::default().ceiling_cache_ttl.as_secs(),
            default_tier: "free".to_string(),
            tiers: BTreeMap::from([("free".to_string(), free), ("pro".to_string(), pro)]),
        }
    }
}

impl QuotaConfig {
    pub fn settings(&self) -> QuotaSettings {
        QuotaSettings {
            ceiling_cache_ttl: Duration::from_secs(self.ceiling_cache_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PollingConfig {
    #[validate(range(min = 1))]
    pub interval_seconds: u64,
    #[validate(range(min = 1))]
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let defaults = PollPolicy::default();
        Self {
            interval_seconds: defaults.interval.as_secs(),
            max_attempts: defaults.max_attempts,
        }
    }
}

impl PollingConfig {
    pub fn to_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.interval_seconds),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Models rated below this are skipped by "Again".
    pub again_min_rating: Option<f64>,
    pub models: Vec<ModelRanking>,
}

/// Seed rankings: model, service, quality, rating, tags, price per 1k input/output tokens in 1e-5 USD.
type SeedRanking = (&'static str, &'static str, u32, f64, &'static [ModelTag], Option<(i64, i64)>);

const SEED_CATALOG: &[SeedRanking] = &[
    ("claude-sonnet-4-20250514", anthropic::PROVIDER_NAME, 95, 4.8,
        &[ModelTag::Chat, ModelTag::Code, ModelTag::Reasoning, ModelTag::Vision], Some((300, 1500))),
    ("gpt-4o", openai::PROVIDER_NAME, 90, 4.6, &[ModelTag::Chat, ModelTag::Code, ModelTag::Vision], Some((250, 1000))),
    ("gemini-2.5-flash", gemini::PROVIDER_NAME, 85, 4.4,
        &[ModelTag::Chat, ModelTag::Reasoning, ModelTag::Vision], Some((30, 250))),
    ("gpt-4o-mini", openai::PROVIDER_NAME, 75, 4.2, &[ModelTag::Chat, ModelTag::Code], Some((15, 60))),
    ("gpt-image-1", openai::PROVIDER_NAME, 90, 4.5, &[ModelTag::ImageGeneration], None),
    ("veo-3.0-generate-001", gemini::PROVIDER_NAME, 90, 4.5, &[ModelTag::VideoGeneration], None),
    ("text-embedding-3-small", openai::PROVIDER_NAME, 80, 4.3, &[ModelTag::Embedding], Some((2, 0))),
];

impl Default for CatalogConfig {
    fn default() -> Self {
        let models = SEED_CATALOG
            .iter()
            .map(|&(id, service, quality, rating, tags, prices)| ModelRanking {
                model_id: id.to_string(),
                service: service.to_string(),
                quality,
                rating,
                tags: tags.to_vec(),
                pricing: prices.map(|(input, output)| PricingInfo {
                    input_per_1k_tokens: Decimal::new(input, 5),
                    output_per_1k_tokens: Decimal::new(output, 5),
                }),
            })
            .collect();

        Self {
            again_min_rating: Some(3.0),
            models,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub ledger: LedgerBackend,
    /// Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerBackend::Sqlite,
            database_path: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let provider = |defaults: &[(Capability, &str)], enabled: bool| ProviderConfig {
            enabled,
            default_models: defaults
                .iter()
                .map(|(capability, model)| (capability.as_str().to_string(), model.to_string()))
                .collect(),
            ..ProviderConfig::default()
        };

        let providers = BTreeMap::from([
            (
                openai::PROVIDER_NAME.to_string(),
                provider(&[(Capability::Chat, "gpt-4o-mini"), (Capability::ImageGeneration, "gpt-image-1")], true),
            ),
            (
                anthropic::PROVIDER_NAME.to_string(),
                provider(&[(Capability::Chat, "claude-sonnet-4-20250514")], true),
            ),
            (
                gemini::PROVIDER_NAME.to_string(),
                provider(&[(Capability::Chat, "gemini-2.5-flash")], true),
            ),
            (ollama::PROVIDER_NAME.to_string(), provider(&[(Capability::Chat, "llama3.2")], false)),
        ]);

        let defaults = [
            (Capability::Chat, openai::PROVIDER_NAME, "gpt-4o-mini"),
            (Capability::Vision, openai::PROVIDER_NAME, "gpt-4o"),
            (Capability::Embeddings, openai::PROVIDER_NAME, "text-embedding-3-small"),
            (Capability::ImageGeneration, openai::PROVIDER_NAME, "gpt-image-1"),
            (Capability::VideoGeneration, gemini::PROVIDER_NAME, "veo-3.0-generate-001"),
            (Capability::SpeechToText, openai::PROVIDER_NAME, "whisper-1"),
            (Capability::TextToSpeech, openai::PROVIDER_NAME, "gpt-4o-mini-tts"),
        ]
        .into_iter()
        .map(|(capability, provider, model)| (capability.as_str().to_string(), ModelTarget::new(provider, model)))
        .collect();

        Self {
            providers,
            defaults,
            circuit_breaker: BreakerConfig::default(),
            quotas: QuotaConfig::default(),
            timeouts: TimeoutBudgets::default(),
            polling: PollingConfig::default(),
            catalog: CatalogConfig::default(),
            quirks: BTreeMap::new(),
            storage: StorageConfig::default(),
        }
    }
}

fn parse_capability(name: &str, context: &str) -> Result<Capability> {
    Capability::parse(name).ok_or_else(|| Error::config(format!("Unknown capability '{}' in {}", name, context)))
}

impl AppConfig {
    /// Load from the platform config file, writing defaults first if it is absent.
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();
        if !config_file.exists() {
            info!("Config file not found, writing defaults to {:?}", config_file);
            Self::default().save_to(&config_file).await?;
        }
        Self::load_from(&config_file)
    }

    /// Layer the file at `path` and `MODELGATE__*` environment variables over defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let defaults = toml::to_string(&Self::default())
            .map_err(|e| Error::config(format!("Failed to render default configuration: {}", e)))?;

        let config: AppConfig = Config::builder()
            .add_source(File::from_str(&defaults, FileFormat::Toml))
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("MODELGATE").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.check()?;
        info!("Configuration loaded ({} providers)", config.providers.len());
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        self.save_to(&paths.config_file()).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize configuration: {}", e)))?;
        fs::write(path, content).await?;
        info!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Field validation plus the cross-field rules derive attributes cannot express.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Configuration validation failed: {}", e)))?;

        for (name, provider) in &self.providers {
            if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                return Err(Error::config(format!("Unknown provider '{}'", name)));
            }
            if provider.timeout_seconds == 0 {
                return Err(Error::config(format!("Provider {} has a zero timeout", name)));
            }
            if let Some(base_url) = &provider.base_url {
                url::Url::parse(base_url)
                    .map_err(|e| Error::config(format!("Provider {} has an invalid base_url: {}", name, e)))?;
            }
            for capability in provider.default_models.keys() {
                parse_capability(capability, &format!("providers.{}.default_models", name))?;
            }
        }

        for (capability, target) in &self.defaults {
            parse_capability(capability, "defaults")?;
            if target.model.trim().is_empty() {
                return Err(Error::config(format!("Default {} model is empty", capability)));
            }
        }

        self.circuit_breaker
            .to_breaker_config()
            .validate()
            .map_err(|e| Error::config(e.to_string()))?;

        for (tier, policy) in &self.quotas.tiers {
            for (action, ceilings) in &policy.actions {
                parse_capability(action, &format!("quotas.tiers.{}", tier))?;
                let usable = match policy.strategy {
                    QuotaStrategy::Lifetime => ceilings.lifetime.is_some(),
                    QuotaStrategy::Rolling => ceilings.hourly.is_some() || ceilings.monthly.is_some(),
                };
                if !usable {
                    return Err(Error::config(format!(
                        "Tier {} action {} sets no ceiling for its {:?} strategy",
                        tier, action, policy.strategy
                    )));
                }
            }
        }

        for model in &self.catalog.models {
            if model.model_id.trim().is_empty() || model.service.trim().is_empty() {
                return Err(Error::config("Catalog entries need a model id and a service"));
            }
            if model.rating < 0.0 {
                return Err(Error::config(format!("Model {} has a negative rating", model.model_id)));
            }
        }

        Ok(())
    }

    pub fn system_defaults(&self) -> Result<BTreeMap<Capability, ModelTarget>> {
        self.defaults
            .iter()
            .map(|(name, target)| Ok((parse_capability(name, "defaults")?, target.clone())))
            .collect()
    }

    pub fn database_path(&self, paths: &AppPaths) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }
}
