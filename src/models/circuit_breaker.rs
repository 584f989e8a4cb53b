//! Per backend-operation circuit breaker.
//!
//! State lives in the injected [`StateStore`] under `circuit:<provider>:<operation>`
//! so every handler sharing the store sees the same circuit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::platform::Clock;
use crate::storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive backend failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Successful probes that close a half-open circuit.
    pub success_threshold: u32,
    /// How long a circuit stays open before probing.
    pub timeout: Duration,
    pub half_open_max_calls: u32,
    /// Lifetime of a stored record; an expired record reads as a fresh closed circuit.
    pub state_ttl: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            state_ttl: Duration::from_secs(3600),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 || self.half_open_max_calls == 0 {
            return Err(Error::invalid_request("Circuit breaker thresholds must be at least 1"));
        }
        if self.success_threshold > self.half_open_max_calls {
            return Err(Error::invalid_request(format!(
                "success_threshold ({}) cannot exceed half_open_max_calls ({})",
                self.success_threshold, self.half_open_max_calls
            )));
        }
        if self.state_ttl <= self.timeout {
            return Err(Error::invalid_request("Circuit state TTL must be longer than the open timeout"));
        }
        Ok(())
    }
}

/// Stored state of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_attempts: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_attempts: 0,
            opened_at: None,
            last_failure_at: None,
            last_error: None,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }
}

impl CircuitRecord {
    fn enter_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.success_count = 0;
        self.half_open_attempts = 0;
    }

    fn enter_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.success_count = 0;
        self.half_open_attempts = 0;
    }

    fn enter_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_attempts = 0;
        self.opened_at = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStats {
    pub service: String,
    #[serde(flatten)]
    pub record: CircuitRecord,
    /// Remaining cooldown while open.
    pub retry_after: Option<Duration>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

enum Admission {
    Proceed,
    ShortCircuit { retry_after: Duration },
}

pub fn service_key(provider: &str, operation: &str) -> String {
    format!("{}:{}", provider, operation)
}

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        info!(
            "Creating circuit breaker with failure threshold {}, success threshold {}, timeout {:?} (store: {})",
            config.failure_threshold,
            config.success_threshold,
            config.timeout,
            store.store_name()
        );
        Self { config, store, clock }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn storage_key(service: &str) -> String {
        format!("circuit:{}", service)
    }

    async fn load(&self, service: &str) -> Result<CircuitRecord> {
        Ok(self
            .store
            .get::<CircuitRecord>(&Self::storage_key(service))
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, service: &str, record: &CircuitRecord) -> Result<()> {
        self.store
            .set(&Self::storage_key(service), record, self.config.state_ttl)
            .await
    }

    fn remaining_cooldown(&self, record: &CircuitRecord, now: DateTime<Utc>) -> Duration {
        let opened_at = record.opened_at.unwrap_or(now);
        let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
        self.config.timeout.saturating_sub(elapsed)
    }

    /// Run `operation` through the circuit for `service`. Backend failures
    /// count toward opening; the original error is always returned unchanged.
    pub async fn execute<T, F, Fut>(&self, service: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.admit(service).await? {
            Admission::Proceed => self.run(service, operation).await,
            Admission::ShortCircuit { retry_after } => Err(Error::BackendUnavailable {
                service: service.to_string(),
                retry_after,
            }),
        }
    }

    /// Like [`execute`](Self::execute) but returns `fallback()` instead of
    /// `BackendUnavailable` when the circuit short-circuits.
    pub async fn execute_with_fallback<T, F, Fut, FB>(&self, service: &str, operation: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> T,
    {
        match self.admit(service).await? {
            Admission::Proceed => self.run(service, operation).await,
            Admission::ShortCircuit { retry_after } => {
                debug!("Circuit '{}' open, serving fallback ({:?} remaining)", service, retry_after);
                Ok(fallback())
            }
        }
    }

    async fn run<T, F, Fut>(&self, service: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = operation().await;

        let recorded = match &result {
            Ok(_) => self.on_success(service).await,
            Err(error) if error.is_backend_failure() => self.on_failure(service, error).await,
            Err(error) => {
                debug!("Circuit '{}' ignoring caller-side error: {}", service, error);
                Ok(())
            }
        };
        if let Err(e) = recorded {
            warn!("Failed to record outcome for circuit '{}': {}", service, e);
        }

        result
    }

    async fn admit(&self, service: &str) -> Result<Admission> {
        let now = self.clock.now();
        let mut record = self.load(service).await?;

        if record.state == CircuitState::Open {
            let retry_after = self.remaining_cooldown(&record, now);
            if !retry_after.is_zero() {
                debug!("Circuit breaker '{}' is open, rejecting call", service);
                record.rejected_calls += 1;
                self.save(service, &record).await?;
                return Ok(Admission::ShortCircuit { retry_after });
            }
            record.enter_half_open();
            info!("Circuit breaker '{}' transitioning to half-open", service);
        }

        if record.state == CircuitState::HalfOpen {
            if record.half_open_attempts >= self.config.half_open_max_calls {
                warn!(
                    "Circuit breaker '{}' exhausted {} half-open probes, reopening",
                    service, self.config.half_open_max_calls
                );
                record.enter_open(now);
                record.rejected_calls += 1;
                self.save(service, &record).await?;
                return Ok(Admission::ShortCircuit {
                    retry_after: self.config.timeout,
                });
            }
            record.half_open_attempts += 1;
            debug!(
                "Circuit breaker '{}' allowing half-open probe {}/{}",
                service, record.half_open_attempts, self.config.half_open_max_calls
            );
            self.save(service, &record).await?;
        }

        Ok(Admission::Proceed)
    }

    async fn on_success(&self, service: &str) -> Result<()> {
        let mut record = self.load(service).await?;
        record.total_successes += 1;

        match record.state {
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.config.success_threshold {
                    record.enter_closed();
                    info!("Circuit breaker '{}' recovered, transitioning to closed", service);
                }
            }
            CircuitState::Closed => {
                if record.failure_count > 0 {
                    debug!("Circuit breaker '{}' reset failure count from {}", service, record.failure_count);
                }
                record.failure_count = 0;
            }
            // Another handler reopened the circuit while this call was in flight
            CircuitState::Open => {}
        }

        self.save(service, &record).await
    }

    async fn on_failure(&self, service: &str, error: &Error) -> Result<()> {
        let now = self.clock.now();
        let mut record = self.load(service).await?;
        record.failure_count += 1;
        record.total_failures += 1;
        record.last_failure_at = Some(now);
        record.last_error = Some(error.to_string());

        match record.state {
            CircuitState::Closed if record.failure_count >= self.config.failure_threshold => {
                record.enter_open(now);
                warn!(
                    "Circuit breaker '{}' opened due to {} consecutive failures",
                    service, record.failure_count
                );
            }
            CircuitState::Closed => {
                debug!(
                    "Circuit breaker '{}' failure count: {}/{}",
                    service, record.failure_count, self.config.failure_threshold
                );
            }
            CircuitState::HalfOpen => {
                record.enter_open(now);
                warn!("Circuit breaker '{}' re-opened during half-open test", service);
            }
            CircuitState::Open => {}
        }

        self.save(service, &record).await
    }

    /// Current state as seen by the next call, with an elapsed cooldown reported as half-open.
    pub async fn state(&self, service: &str) -> Result<CircuitState> {
        let record = self.load(service).await?;
        if record.state == CircuitState::Open && self.remaining_cooldown(&record, self.clock.now()).is_zero() {
            return Ok(CircuitState::HalfOpen);
        }
        Ok(record.state)
    }

    pub async fn stats(&self, service: &str) -> Result<CircuitStats> {
        let record = self.load(service).await?;
        let retry_after = (record.state == CircuitState::Open)
            .then(|| self.remaining_cooldown(&record, self.clock.now()));

        Ok(CircuitStats {
            service: service.to_string(),
            record,
            retry_after,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
        })
    }

    pub async fn force_open(&self, service: &str) -> Result<()> {
        let mut record = self.load(service).await?;
        record.enter_open(self.clock.now());
        warn!("Circuit breaker '{}' manually opened", service);
        self.save(service, &record).await
    }

    pub async fn reset(&self, service: &str) -> Result<()> {
        self.store.delete(&Self::storage_key(service)).await?;
        info!("Circuit breaker '{}' manually closed and reset", service);
        Ok(())
    }
}
