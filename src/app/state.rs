use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::app::config::{AppConfig, LedgerBackend, ProviderConfig};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::models::{
    anthropic, gemini, ollama, openai, AdapterSettings, AnthropicProvider, Capability, CircuitBreaker,
    GeminiProvider, ModelSelector, OllamaProvider, OpenAIProvider, ProviderRegistry, QuirkTable,
    QuotaEnforcer, StaticCatalog, StaticCeilings,
};
use crate::platform::{AppPaths, Clock, CredentialResolver, SystemClock};
use crate::storage::{Database, MemoryStateStore, MemoryUsageLedger, StateStore, UsageLedger, UsageRepository};

/// Everything the binary needs, wired from one configuration.
pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    paths: AppPaths,
    credentials: CredentialResolver,
    database: Option<Database>,
    catalog: Arc<StaticCatalog>,
    ceilings: Arc<StaticCeilings>,
    gateway: Arc<Gateway>,
}

impl AppState {
    pub async fn new(config: AppConfig, paths: AppPaths, credentials: CredentialResolver) -> Result<Self> {
        info!("Initializing application state");
        config.check()?;

        let (database, ledger): (Option<Database>, Arc<dyn UsageLedger>) = match config.storage.ledger {
            LedgerBackend::Sqlite => {
                let db_path = config.database_path(&paths);
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let database = Database::open(&db_path).await?;
                if !database.verify_integrity().await? {
                    warn!("Usage ledger at {:?} failed its integrity check", db_path);
                }
                let ledger: Arc<dyn UsageLedger> = Arc::new(UsageRepository::new(database.get_pool()));
                (Some(database), ledger)
            }
            LedgerBackend::Memory => {
                warn!("Usage ledger is in memory; quotas reset on restart");
                let ledger: Arc<dyn UsageLedger> = Arc::new(MemoryUsageLedger::new());
                (None, ledger)
            }
        };

        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let quirks = Arc::new(QuirkTable::new(config.quirks.clone()));

        let registry = build_registry(&config, &credentials, quirks).await?;
        let catalog = Arc::new(StaticCatalog::new(config.catalog.models.clone()));
        let ceilings = Arc::new(StaticCeilings::new(config.quotas.tiers.clone()));

        let breaker = CircuitBreaker::new(config.circuit_breaker.to_breaker_config(), store.clone(), clock.clone());
        let quotas = QuotaEnforcer::new(ceilings.clone(), ledger, store, clock.clone(), config.quotas.settings());

        let gateway = Gateway::new(
            Arc::new(registry),
            breaker,
            Arc::new(quotas),
            ModelSelector::new(catalog.clone()),
        )
        .with_defaults(config.system_defaults()?)
        .with_timeouts(config.timeouts)
        .with_poll_policy(config.polling.to_policy())
        .with_again_min_rating(config.catalog.again_min_rating)
        .with_clock(clock);

        info!("Application state ready");
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            paths,
            credentials,
            database,
            catalog,
            ceilings,
            gateway: Arc::new(gateway),
        })
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    /// Apply, validate and persist a change. The catalog and quota ceilings
    /// take effect immediately; provider settings need a restart.
    pub async fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        debug!("Updating application configuration");

        let mut updated = self.get_config();
        updater(&mut updated);
        updated.check()?;
        updated.save(&self.paths).await?;

        self.catalog.replace(updated.catalog.models.clone());
        self.ceilings.replace(updated.quotas.tiers.clone());
        *self.config.write() = updated;

        info!("Configuration updated and saved");
        Ok(())
    }

    pub async fn set_api_key(&self, provider: &str, api_key: &str) -> Result<()> {
        ensure_known(provider)?;
        self.credentials.store_api_key(provider, api_key).await?;
        self.update_config(|config| {
            config.providers.entry(provider.to_string()).or_default().enabled = true;
        })
        .await
    }

    pub async fn remove_api_key(&self, provider: &str) -> Result<()> {
        ensure_known(provider)?;
        self.credentials.delete_api_key(provider).await
    }
}

fn ensure_known(provider: &str) -> Result<()> {
    if crate::app::config::KNOWN_PROVIDERS.contains(&provider) {
        Ok(())
    } else {
        Err(Error::invalid_request(format!("Unknown provider '{}'", provider)))
    }
}

async fn adapter_settings(
    name: &str,
    provider: &ProviderConfig,
    default_base_url: &str,
    credentials: &CredentialResolver,
    quirks: &Arc<QuirkTable>,
) -> AdapterSettings {
    let api_key = credentials.resolve(name, provider.api_key.as_deref()).await;
    let base_url = provider.base_url.as_deref().unwrap_or(default_base_url);

    let mut settings = AdapterSettings::new(base_url)
        .with_api_key(api_key)
        .with_timeout(Duration::from_secs(provider.timeout_seconds))
        .with_quirks(quirks.clone());
    for (capability, model) in &provider.default_models {
        if let Some(capability) = Capability::parse(capability) {
            settings = settings.with_default_model(capability, model.clone());
        }
    }
    settings
}

/// Enabled providers are registered even without credentials so calls name
/// them in `CredentialsMissing` rather than reporting an unknown provider.
pub async fn build_registry(
    config: &AppConfig,
    credentials: &CredentialResolver,
    quirks: Arc<QuirkTable>,
) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    for (name, provider) in config.providers.iter().filter(|(_, p)| p.enabled) {
        match name.as_str() {
            openai::PROVIDER_NAME => {
                let settings = adapter_settings(name, provider, openai::DEFAULT_BASE_URL, credentials, &quirks).await;
                registry.register(Arc::new(OpenAIProvider::new(settings)?));
            }
            anthropic::PROVIDER_NAME => {
                let settings =
                    adapter_settings(name, provider, anthropic::DEFAULT_BASE_URL, credentials, &quirks).await;
                registry.register(Arc::new(AnthropicProvider::new(settings)?));
            }
            gemini::PROVIDER_NAME => {
                let settings = adapter_settings(name, provider, gemini::DEFAULT_BASE_URL, credentials, &quirks).await;
                registry.register(Arc::new(GeminiProvider::new(settings)?));
            }
            ollama::PROVIDER_NAME => {
                let settings = adapter_settings(name, provider, ollama::DEFAULT_BASE_URL, credentials, &quirks).await;
                registry.register(Arc::new(OllamaProvider::new(settings)?));
            }
            other => return Err(Error::config(format!("Unknown provider '{}'", other))),
        }
    }

    info!("Registered {} providers", registry.descriptors().count());
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelRanking, ModelTag};
    use crate::platform::MemoryStorage;
    use tempfile::TempDir;

    fn resolver() -> CredentialResolver {
        CredentialResolver::with_backend(Box::new(MemoryStorage::default())).without_env()
    }

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.ledger = LedgerBackend::Memory;
        if let Some(openai) = config.providers.get_mut("openai") {
            openai.api_key = Some("sk-test".to_string());
        }
        config
    }

    #[tokio::test]
    async fn test_registry_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let state = AppState::new(memory_config(), AppPaths::with_root(temp_dir.path()), resolver())
            .await
            .unwrap();

        let gateway = state.gateway();
        let registry = gateway.registry();
        assert_eq!(registry.providers_for(Capability::Chat), vec!["anthropic", "gemini", "openai"]);
        assert_eq!(registry.providers_for(Capability::VideoGeneration), vec!["gemini"]);
        assert!(registry.descriptor("ollama").is_none());

        assert!(registry.descriptor("openai").unwrap().is_available());
        assert!(!registry.descriptor("anthropic").unwrap().is_available());
        assert!(state.database().is_none());
    }

    #[tokio::test]
    async fn test_keyring_credentials_enable_provider() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = memory_config();
        config.providers.insert("ollama".to_string(), ProviderConfig::default());

        let credentials = resolver();
        credentials.store_api_key("anthropic", "sk-ant-test").await.unwrap();

        let state = AppState::new(config, AppPaths::with_root(temp_dir.path()), credentials)
            .await
            .unwrap();
        let gateway = state.gateway();
        assert!(gateway.registry().descriptor("anthropic").unwrap().is_available());
        assert!(gateway.registry().descriptor("ollama").unwrap().is_available());
    }

    #[tokio::test]
    async fn test_update_config_swaps_catalog() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(temp_dir.path());
        paths.ensure_dirs_exist().unwrap();
        let state = AppState::new(memory_config(), paths, resolver()).await.unwrap();

        state
            .update_config(|config| {
                config.catalog.models = vec![ModelRanking {
                    model_id: "llama3.2".to_string(),
                    service: "ollama".to_string(),
                    quality: 50,
                    rating: 4.0,
                    tags: vec![ModelTag::Chat],
                    pricing: None,
                }];
            })
            .await
            .unwrap();

        let eligible = state.gateway().selector().eligible(ModelTag::Chat, None);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].model_id, "llama3.2");
        assert!(state.paths().config_file().exists());

        let rejected = state
            .update_config(|config| config.circuit_breaker.failure_threshold = 0)
            .await;
        assert!(rejected.is_err());
        assert_eq!(state.get_config().circuit_breaker.failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_sqlite_ledger_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(temp_dir.path());
        paths.ensure_dirs_exist().unwrap();

        let mut config = memory_config();
        config.storage.ledger = LedgerBackend::Sqlite;
        let state = AppState::new(config, paths, resolver()).await.unwrap();

        assert!(state.database().is_some());
        assert!(state.paths().database_file().exists());
    }
}
