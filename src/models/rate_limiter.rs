//! Per-caller quota enforcement over the usage ledger.
//!
//! Counts are always read from the ledger so window boundaries are exact; only
//! the ceiling configuration is cached in the state store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::platform::Clock;
use crate::storage::{StateStore, UsageLedger, UsageMetadata, UsageRecord, UsageStatistics};

pub const HOURLY_WINDOW: Duration = Duration::from_secs(3600);
pub const MONTHLY_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStrategy {
    /// Total count ever, never resets.
    Lifetime,
    /// Independent hourly and monthly rolling windows.
    Rolling,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionCeilings {
    pub lifetime: Option<u64>,
    pub hourly: Option<u64>,
    pub monthly: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub strategy: QuotaStrategy,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionCeilings>,
}

/// Ceilings that apply to one (tier, action) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCeilings {
    pub strategy: QuotaStrategy,
    pub ceilings: ActionCeilings,
}

/// Where ceiling configuration comes from.
#[async_trait]
pub trait CeilingSource: Send + Sync {
    /// `None` means the pair is unlimited.
    async fn ceilings(&self, tier: &str, action: &str) -> Result<Option<ResolvedCeilings>>;
}

/// Tier policies held in memory and replaceable at runtime.
pub struct StaticCeilings {
    tiers: ArcSwap<BTreeMap<String, TierPolicy>>,
}

impl StaticCeilings {
    pub fn new(tiers: BTreeMap<String, TierPolicy>) -> Self {
        Self {
            tiers: ArcSwap::from_pointee(tiers),
        }
    }

    pub fn replace(&self, tiers: BTreeMap<String, TierPolicy>) {
        info!("Replacing quota configuration ({} tiers)", tiers.len());
        self.tiers.store(Arc::new(tiers));
    }
}

#[async_trait]
impl CeilingSource for StaticCeilings {
    async fn ceilings(&self, tier: &str, action: &str) -> Result<Option<ResolvedCeilings>> {
        let tiers = self.tiers.load();
        Ok(tiers.get(tier).and_then(|policy| {
            policy.actions.get(action).map(|ceilings| ResolvedCeilings {
                strategy: policy.strategy,
                ceilings: ceilings.clone(),
            })
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    Unlimited,
    Lifetime,
    Hourly,
    Monthly,
}

/// Outcome of one evaluated ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCheck {
    #[serde(rename = "type")]
    pub quota_type: QuotaType,
    pub allowed: bool,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub limit: Option<u64>,
    pub used: u64,
    pub remaining: Option<u64>,
    pub resets_at: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub quota_type: QuotaType,
    /// Every ceiling that was evaluated, in evaluation order.
    pub windows: Vec<WindowCheck>,
}

impl QuotaCheck {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            used: 0,
            remaining: None,
            resets_at: None,
            quota_type: QuotaType::Unlimited,
            windows: Vec::new(),
        }
    }

    /// Headline from the denying window, or the tightest one when allowed.
    fn from_windows(windows: Vec<WindowCheck>) -> Self {
        let headline = windows
            .iter()
            .find(|w| !w.allowed)
            .or_else(|| windows.iter().min_by_key(|w| w.remaining))
            .cloned();

        match headline {
            Some(w) => Self {
                allowed: windows.iter().all(|w| w.allowed),
                limit: Some(w.limit),
                used: w.used,
                remaining: Some(w.remaining),
                resets_at: w.resets_at,
                quota_type: w.quota_type,
                windows,
            },
            None => Self::unlimited(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSettings {
    /// How long resolved ceilings stay cached in the state store.
    pub ceiling_cache_ttl: Duration,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            ceiling_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Cached form; distinguishes "unlimited" from "not cached".
#[derive(Debug, Serialize, Deserialize)]
struct CachedCeilings(Option<ResolvedCeilings>);

pub struct QuotaEnforcer {
    source: Arc<dyn CeilingSource>,
    ledger: Arc<dyn UsageLedger>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    settings: QuotaSettings,
}

impl QuotaEnforcer {
    pub fn new(
        source: Arc<dyn CeilingSource>,
        ledger: Arc<dyn UsageLedger>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        settings: QuotaSettings,
    ) -> Self {
        Self {
            source,
            ledger,
            store,
            clock,
            settings,
        }
    }

    async fn resolve(&self, tier: &str, action: &str) -> Result<Option<ResolvedCeilings>> {
        let key = format!("quota:ceilings:{}:{}", tier, action);
        match self.store.get::<CachedCeilings>(&key).await {
            Ok(Some(CachedCeilings(cached))) => return Ok(cached),
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable cached ceilings for {}: {}", key, e),
        }

        let resolved = self.source.ceilings(tier, action).await?;
        if let Err(e) = self
            .store
            .set(&key, &CachedCeilings(resolved.clone()), self.settings.ceiling_cache_ttl)
            .await
        {
            warn!("Failed to cache ceilings for {}: {}", key, e);
        }
        Ok(resolved)
    }

    async fn evaluate_window(
        &self,
        caller_id: &str,
        action: &str,
        quota_type: QuotaType,
        limit: u64,
        window: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<WindowCheck> {
        let since = match window {
            Some(window) => {
                let length = chrono::Duration::from_std(window)
                    .map_err(|e| Error::invalid_request(format!("Invalid quota window: {}", e)))?;
                Some(now - length)
            }
            None => None,
        };

        let counted = self.ledger.count(caller_id, action, since).await?;
        let resets_at = match (window, counted.oldest) {
            (Some(window), Some(oldest)) => chrono::Duration::from_std(window).ok().map(|w| oldest + w),
            _ => None,
        };

        Ok(WindowCheck {
            quota_type,
            allowed: counted.count < limit,
            limit,
            used: counted.count,
            remaining: limit.saturating_sub(counted.count),
            resets_at,
        })
    }

    /// Read-only check of whether `caller_id` may perform `action` now.
    pub async fn check(&self, caller_id: &str, tier: &str, action: &str) -> Result<QuotaCheck> {
        let Some(resolved) = self.resolve(tier, action).await? else {
            debug!("No quota configured for tier '{}' action '{}'", tier, action);
            return Ok(QuotaCheck::unlimited());
        };

        let now = self.clock.now();
        let ceilings = &resolved.ceilings;
        let mut windows = Vec::new();

        match resolved.strategy {
            QuotaStrategy::Lifetime => {
                if let Some(limit) = ceilings.lifetime {
                    windows.push(
                        self.evaluate_window(caller_id, action, QuotaType::Lifetime, limit, None, now)
                            .await?,
                    );
                }
            }
            QuotaStrategy::Rolling => {
                if let Some(limit) = ceilings.hourly {
                    let hourly = self
                        .evaluate_window(caller_id, action, QuotaType::Hourly, limit, Some(HOURLY_WINDOW), now)
                        .await?;
                    let denied = !hourly.allowed;
                    windows.push(hourly);
                    if denied {
                        let check = QuotaCheck::from_windows(windows);
                        debug!("Hourly quota for {} on {} exhausted, skipping monthly", caller_id, action);
                        return Ok(check);
                    }
                }
                if let Some(limit) = ceilings.monthly {
                    windows.push(
                        self.evaluate_window(caller_id, action, QuotaType::Monthly, limit, Some(MONTHLY_WINDOW), now)
                            .await?,
                    );
                }
            }
        }

        let check = QuotaCheck::from_windows(windows);
        debug!(
            "Quota check for {} on {}: allowed={}, used={}, limit={:?}",
            caller_id, action, check.allowed, check.used, check.limit
        );
        Ok(check)
    }

    /// [`check`](Self::check), turning a denial into `QuotaExceeded`.
    pub async fn enforce(&self, caller_id: &str, tier: &str, action: &str) -> Result<QuotaCheck> {
        let check = self.check(caller_id, tier, action).await?;
        if check.allowed {
            return Ok(check);
        }

        warn!(
            "Quota exceeded for {} on {}: {}/{} ({:?})",
            caller_id,
            action,
            check.used,
            check.limit.unwrap_or_default(),
            check.quota_type
        );
        Err(Error::QuotaExceeded {
            action: action.to_string(),
            limit: check.limit.unwrap_or_default(),
            used: check.used,
            resets_at: check.resets_at,
        })
    }

    /// Append one ledger row for an action that actually ran.
    pub async fn record_usage(&self, caller_id: &str, action: &str, metadata: UsageMetadata) -> Result<UsageRecord> {
        let record = UsageRecord::new(caller_id, action, self.clock.now(), metadata);
        self.ledger.append(record.clone()).await?;
        debug!("Recorded {} usage for {} via {}/{}", action, caller_id, record.provider, record.model);
        Ok(record)
    }

    pub async fn usage_statistics(&self, caller_id: &str, since: Option<DateTime<Utc>>) -> Result<UsageStatistics> {
        self.ledger.statistics(Some(caller_id), since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ManualClock;
    use crate::storage::{MemoryStateStore, MemoryUsageLedger};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tiers() -> BTreeMap<String, TierPolicy> {
        let mut tiers = BTreeMap::new();
        tiers.insert(
            "free".to_string(),
            TierPolicy {
                strategy: QuotaStrategy::Lifetime,
                actions: BTreeMap::from([(
                    "chat".to_string(),
                    ActionCeilings {
                        lifetime: Some(3),
                        ..ActionCeilings::default()
                    },
                )]),
            },
        );
        tiers.insert(
            "pro".to_string(),
            TierPolicy {
                strategy: QuotaStrategy::Rolling,
                actions: BTreeMap::from([
                    (
                        "chat".to_string(),
                        ActionCeilings {
                            hourly: Some(5),
                            monthly: Some(100),
                            ..ActionCeilings::default()
                        },
                    ),
                    (
                        "image_generation".to_string(),
                        ActionCeilings {
                            hourly: Some(10),
                            monthly: Some(3),
                            ..ActionCeilings::default()
                        },
                    ),
                ]),
            },
        );
        tiers
    }

    fn enforcer_with(source: Arc<dyn CeilingSource>) -> (QuotaEnforcer, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let enforcer = QuotaEnforcer::new(
            source,
            Arc::new(MemoryUsageLedger::new()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(clock.clone()),
            QuotaSettings::default(),
        );
        (enforcer, clock)
    }

    fn enforcer() -> (QuotaEnforcer, ManualClock) {
        enforcer_with(Arc::new(StaticCeilings::new(tiers())))
    }

    fn metadata() -> UsageMetadata {
        UsageMetadata {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            cost: Decimal::new(15, 4),
            latency_ms: 120,
            status: None,
        }
    }

    #[tokio::test]
    async fn test_lifetime_quota() {
        let (enforcer, clock) = enforcer();

        let mut previous = 0;
        for expected in 0..3u64 {
            let check = enforcer.check("alice", "free", "chat").await.unwrap();
            assert!(check.allowed);
            assert_eq!(check.used, expected);
            assert!(check.used >= previous);
            previous = check.used;
            assert_eq!(check.quota_type, QuotaType::Lifetime);
            enforcer.record_usage("alice", "chat", metadata()).await.unwrap();
        }

        // Never resets
        clock.advance_secs(365 * 24 * 3600);
        let check = enforcer.check("alice", "free", "chat").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.used, 3);
        assert_eq!(check.remaining, Some(0));
        assert_eq!(check.resets_at, None);

        match enforcer.enforce("alice", "free", "chat").await {
            Err(Error::QuotaExceeded { limit, used, resets_at, .. }) => {
                assert_eq!((limit, used), (3, 3));
                assert_eq!(resets_at, None);
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }

        // Other callers are unaffected
        assert!(enforcer.check("bob", "free", "chat").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_hourly_window_boundary() {
        let (enforcer, clock) = enforcer();
        for _ in 0..5 {
            enforcer.record_usage("carol", "chat", metadata()).await.unwrap();
        }

        let check = enforcer.check("carol", "pro", "chat").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.quota_type, QuotaType::Hourly);
        // Monthly is not evaluated once hourly denies
        assert_eq!(check.windows.len(), 1);
        assert_eq!(check.resets_at, Some(clock.now() + chrono::Duration::seconds(3600)));

        clock.advance_secs(3601);
        let check = enforcer.check("carol", "pro", "chat").await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.windows[0].quota_type, QuotaType::Hourly);
        assert_eq!(check.windows[0].used, 0);
        assert_eq!(check.windows[1].used, 5);
        assert_eq!(check.windows.len(), 2);
    }

    #[tokio::test]
    async fn test_monthly_denial_after_hourly_passes() {
        let (enforcer, clock) = enforcer();
        let start = clock.now();
        for _ in 0..3 {
            enforcer.record_usage("dave", "image_generation", metadata()).await.unwrap();
        }

        clock.advance_secs(2 * 3600);
        let check = enforcer.check("dave", "pro", "image_generation").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.quota_type, QuotaType::Monthly);
        assert_eq!(check.windows.len(), 2);
        assert!(check.windows[0].allowed);
        assert_eq!(check.resets_at, Some(start + chrono::Duration::days(30)));
    }

    #[tokio::test]
    async fn test_unconfigured_pairs_are_unlimited() {
        let (enforcer, _) = enforcer();
        let check = enforcer.check("erin", "pro", "embeddings").await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.quota_type, QuotaType::Unlimited);
        assert_eq!(check.limit, None);

        assert!(enforcer.check("erin", "enterprise", "chat").await.unwrap().allowed);
    }

    struct CountingSource {
        inner: StaticCeilings,
        loads: AtomicU32,
    }

    #[async_trait]
    impl CeilingSource for CountingSource {
        async fn ceilings(&self, tier: &str, action: &str) -> Result<Option<ResolvedCeilings>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.ceilings(tier, action).await
        }
    }

    #[tokio::test]
    async fn test_ceilings_are_cached() {
        let source = Arc::new(CountingSource {
            inner: StaticCeilings::new(tiers()),
            loads: AtomicU32::new(0),
        });
        let (enforcer, _) = enforcer_with(source.clone());

        enforcer.check("frank", "pro", "chat").await.unwrap();
        enforcer.check("frank", "pro", "chat").await.unwrap();
        enforcer.check("frank", "pro", "video_generation").await.unwrap();
        enforcer.check("frank", "pro", "video_generation").await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_usage_statistics() {
        let (enforcer, _) = enforcer();
        enforcer.record_usage("gina", "chat", metadata()).await.unwrap();
        enforcer.record_usage("gina", "chat", metadata()).await.unwrap();
        enforcer.record_usage("hank", "chat", metadata()).await.unwrap();

        let stats = enforcer.usage_statistics("gina", None).await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_output_tokens, 40);
        assert_eq!(stats.total_cost, Decimal::new(30, 4));
        assert_eq!(stats.by_provider["openai"].requests, 2);
    }
}
