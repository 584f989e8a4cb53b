//! Shared key-value store for breaker and quota state.
//!
//! Values are JSON documents with a per-entry TTL. Writes are last-write-wins:
//! callers read, modify and write back without a transaction, so concurrent
//! handlers may overwrite each other's updates.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::Expiry;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// The stored JSON string, or `None` if absent or expired.
    async fn get_json(&self, key: &str) -> Result<Option<String>>;

    async fn set_json(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    fn store_name(&self) -> &str;
}

impl dyn StateStore {
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_json(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.set_json(key, &json, ttl).await
    }
}

/// Upper bound on live entries; least recently used keys are evicted past it.
const MAX_ENTRIES: u64 = 100_000;

/// Expires each entry after the TTL it was written with.
struct PerEntryTtl;

impl Expiry<String, (String, Duration)> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &(String, Duration), _created_at: Instant) -> Option<Duration> {
        Some(value.1)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &(String, Duration),
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

/// In-process store backed by a moka cache.
pub struct MemoryStateStore {
    cache: Cache<String, (String, Duration)>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .eviction_listener(|key, _value, cause| {
                if matches!(cause, RemovalCause::Size) {
                    debug!("State entry {} evicted for capacity", key);
                }
            })
            .build();
        Self { cache }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_json(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|(value, _)| value))
    }

    async fn set_json(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.cache.insert(key.to_string(), (value.to_string(), ttl)).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.cache.remove(key).await.is_some())
    }

    fn store_name(&self) -> &str {
        "memory"
    }
}
