use std::collections::HashMap;

use async_trait::async_trait;
use keyring::Entry;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const KEYRING_SERVICE: &str = "ai.valechat.modelgate.api_keys";

#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()>;
    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>>;
    async fn delete(&self, service: &str, key: &str) -> Result<()>;
}

/// Resolves provider credentials from, in order: explicit configuration,
/// the provider's environment variable, then the OS keyring.
pub struct CredentialResolver {
    backend: Box<dyn SecureStorage>,
    read_env: bool,
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self {
            backend: Box::new(KeyringStorage),
            read_env: true,
        }
    }

    pub fn with_backend(backend: Box<dyn SecureStorage>) -> Self {
        Self {
            backend,
            read_env: true,
        }
    }

    /// Skip environment lookup; keeps tests independent of the host shell.
    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    pub async fn resolve(&self, provider: &str, configured: Option<&str>) -> Option<String> {
        if let Some(key) = configured.filter(|k| !k.trim().is_empty()) {
            debug!("Using configured API key for provider: {}", provider);
            return Some(key.to_string());
        }

        if self.read_env {
            let var = env_var_for(provider);
            if let Ok(key) = std::env::var(&var) {
                if !key.trim().is_empty() {
                    debug!("Using API key from {} for provider: {}", var, provider);
                    return Some(key);
                }
            }
        }

        match self.backend.retrieve(KEYRING_SERVICE, provider).await {
            Ok(found) => {
                if found.is_some() {
                    debug!("Using API key from secure storage for provider: {}", provider);
                }
                found
            }
            Err(e) => {
                // A broken keyring must not block providers configured elsewhere.
                warn!("Secure storage lookup failed for provider {}: {}", provider, e);
                None
            }
        }
    }

    pub async fn store_api_key(&self, provider: &str, key: &str) -> Result<()> {
        debug!("Storing API key for provider: {}", provider);
        self.backend.store(KEYRING_SERVICE, provider, key).await
    }

    pub async fn delete_api_key(&self, provider: &str) -> Result<()> {
        debug!("Deleting API key for provider: {}", provider);
        self.backend.delete(KEYRING_SERVICE, provider).await
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// `openai` -> `OPENAI_API_KEY`, `google-vertex` -> `GOOGLE_VERTEX_API_KEY`.
pub fn env_var_for(provider: &str) -> String {
    let normalized: String = provider
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_API_KEY", normalized)
}

pub struct KeyringStorage;

#[async_trait]
impl SecureStorage for KeyringStorage {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let entry = Entry::new(service, key).map_err(keyring_error)?;
        entry.set_password(value).map_err(keyring_error)?;
        Ok(())
    }

    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
        let entry = Entry::new(service, key).map_err(keyring_error)?;
        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(e)),
        }
    }

    async fn delete(&self, service: &str, key: &str) -> Result<()> {
        let entry = Entry::new(service, key).map_err(keyring_error)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(e)),
        }
    }
}

fn keyring_error(e: keyring::Error) -> Error {
    Error::platform(format!("Secure storage error: {}", e))
}

/// Process-local storage for tests and hosts without a keyring daemon.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<(String, String), String>>,
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert((service.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .get(&(service.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, service: &str, key: &str) -> Result<()> {
        self.entries
            .write()
            .remove(&(service.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_naming() {
        assert_eq!(env_var_for("openai"), "OPENAI_API_KEY");
        assert_eq!(env_var_for("google-vertex"), "GOOGLE_VERTEX_API_KEY");
    }

    #[tokio::test]
    async fn test_configured_key_wins() {
        let resolver = CredentialResolver::with_backend(Box::new(MemoryStorage::default())).without_env();
        resolver.store_api_key("openai", "sk-stored").await.unwrap();

        let key = resolver.resolve("openai", Some("sk-config")).await;
        assert_eq!(key.as_deref(), Some("sk-config"));
    }

    #[tokio::test]
    async fn test_falls_back_to_storage() {
        let resolver = CredentialResolver::with_backend(Box::new(MemoryStorage::default())).without_env();
        assert_eq!(resolver.resolve("anthropic", None).await, None);

        resolver.store_api_key("anthropic", "sk-ant").await.unwrap();
        assert_eq!(resolver.resolve("anthropic", Some("  ")).await.as_deref(), Some("sk-ant"));

        resolver.delete_api_key("anthropic").await.unwrap();
        assert_eq!(resolver.resolve("anthropic", None).await, None);
    }
}
