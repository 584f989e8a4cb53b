//! HTTP plumbing shared by the adapters: settings, client construction and
//! failure translation with provider/model/prompt context in the logs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::models::capability_detection::{ModelQuirks, QuirkTable};
use crate::models::provider::truncate_for_log;
use crate::models::types::{Capability, HealthStatus};

const PROMPT_LOG_CHARS: usize = 80;
const BODY_LOG_CHARS: usize = 500;

/// Per-adapter settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Connect and per-request timeout for non-streaming calls.
    pub timeout: Duration,
    pub default_models: BTreeMap<Capability, String>,
    pub quirks: Arc<QuirkTable>,
}

impl AdapterSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            api_key: None,
            base_url: base_url.into(),
            timeout: Duration::from_secs(60),
            default_models: BTreeMap::new(),
            quirks: Arc::new(QuirkTable::default()),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_model(mut self, capability: Capability, model: impl Into<String>) -> Self {
        self.default_models.insert(capability, model.into());
        self
    }

    pub fn with_quirks(mut self, quirks: Arc<QuirkTable>) -> Self {
        self.quirks = quirks;
        self
    }

    /// Base URL joined with `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub fn require_api_key(&self, provider: &str) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::credentials_missing(provider))
    }

    pub fn quirks_for(&self, provider: &str, model: &str) -> ModelQuirks {
        self.quirks.lookup(provider, model)
    }

    pub fn default_model(&self, capability: Capability) -> Option<&str> {
        self.default_models.get(&capability).map(String::as_str)
    }
}

pub fn build_client(provider: &str, settings: &AdapterSettings) -> Result<Client> {
    Client::builder()
        .connect_timeout(settings.timeout)
        .build()
        .map_err(|e| Error::backend(provider, format!("Failed to create HTTP client: {}", e)))
}

/// Identifies one outbound call for logging and error translation.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
}

impl<'a> CallContext<'a> {
    pub fn new(provider: &'a str, model: &'a str, prompt: &'a str) -> Self {
        Self { provider, model, prompt }
    }

    pub fn transport_error(&self, err: reqwest::Error) -> Error {
        let message = if err.is_timeout() {
            format!("Request timed out: {}", err)
        } else {
            format!("HTTP request failed: {}", err)
        };
        self.failure(message)
    }

    /// Log and build a backend error.
    pub fn failure(&self, message: impl Into<String>) -> Error {
        let message = message.into();
        error!(
            provider = self.provider,
            model = self.model,
            prompt = %truncate_for_log(self.prompt, PROMPT_LOG_CHARS),
            "{} call failed: {}",
            self.provider,
            message
        );
        Error::backend(self.provider, message)
    }

    /// Pass 2xx responses through; anything else becomes a backend error.
    pub async fn check_status(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let body = truncate_for_log(body.trim(), BODY_LOG_CHARS);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            error!(
                provider = self.provider,
                model = self.model,
                prompt = %truncate_for_log(self.prompt, PROMPT_LOG_CHARS),
                "{} API error {}: {}",
                self.provider,
                status,
                body
            );
        } else {
            warn!(
                provider = self.provider,
                model = self.model,
                prompt = %truncate_for_log(self.prompt, PROMPT_LOG_CHARS),
                "{} API rejected request with {}: {}",
                self.provider,
                status,
                body
            );
        }
        Err(Error::backend(self.provider, format!("API error {}: {}", status, body)))
    }

    pub async fn parse_json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let response = self.check_status(response).await?;
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_slice(&body).map_err(|e| self.failure(format!("Failed to parse response: {}", e)))
    }

    pub async fn bytes(&self, response: Response) -> Result<Vec<u8>> {
        let response = self.check_status(response).await?;
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| self.transport_error(e))
    }
}

/// Probe an endpoint and report latency. Used by the descriptors' `get_status`.
pub async fn probe(request: reqwest::RequestBuilder) -> HealthStatus {
    let started = std::time::Instant::now();
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            HealthStatus::healthy(started.elapsed().as_millis() as u64)
        }
        Ok(response) => HealthStatus::unhealthy(format!("Health probe returned {}", response.status())),
        Err(e) => HealthStatus::unhealthy(format!("Health probe failed: {}", e)),
    }
}
