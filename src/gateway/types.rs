use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{Capability, CircuitState, HealthStatus, TimeoutClass};

/// A provider/model pair used as a default for one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    /// Looked up in the model catalog when absent.
    #[serde(default)]
    pub provider: Option<String>,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            model: model.into(),
        }
    }
}

/// Who is calling, for quota accounting and per-caller defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerContext {
    pub id: String,
    pub tier: String,
    #[serde(default)]
    pub default_models: BTreeMap<Capability, ModelTarget>,
}

impl CallerContext {
    pub fn new(id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: tier.into(),
            default_models: BTreeMap::new(),
        }
    }

    pub fn with_default(mut self, capability: Capability, target: ModelTarget) -> Self {
        self.default_models.insert(capability, target);
        self
    }
}

/// Provider and model a call was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub provider: String,
    pub model: String,
}

/// One time budget per capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutBudgets {
    #[validate(range(min = 1))]
    pub text_secs: u64,
    #[validate(range(min = 1))]
    pub media_secs: u64,
    #[validate(range(min = 1))]
    pub audio_secs: u64,
    #[validate(range(min = 1))]
    pub long_running_secs: u64,
}

impl Default for TimeoutBudgets {
    fn default() -> Self {
        Self {
            text_secs: 120,
            media_secs: 180,
            audio_secs: 120,
            long_running_secs: 900,
        }
    }
}

impl TimeoutBudgets {
    pub fn for_class(&self, class: TimeoutClass) -> Duration {
        let secs = match class {
            TimeoutClass::Text => self.text_secs,
            TimeoutClass::Media => self.media_secs,
            TimeoutClass::Audio => self.audio_secs,
            TimeoutClass::LongRunning => self.long_running_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Serializable view of a registered provider at report time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorSnapshot {
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub default_models: BTreeMap<Capability, String>,
    pub available: bool,
    /// Probe result combined with breaker state.
    pub healthy: bool,
    pub status: HealthStatus,
    pub circuits: BTreeMap<Capability, CircuitState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub healthy: bool,
    pub providers: Vec<DescriptorSnapshot>,
}

impl HealthReport {
    pub fn provider(&self, name: &str) -> Option<&DescriptorSnapshot> {
        self.providers.iter().find(|p| p.name == name)
    }
}
