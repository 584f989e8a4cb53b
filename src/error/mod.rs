use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No credentials configured for provider '{provider}'")]
    CredentialsMissing { provider: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend '{service}' is unavailable, retry after {}s", retry_after.as_secs())]
    BackendUnavailable { service: String, retry_after: Duration },

    #[error("Backend error from {provider}: {message}")]
    Backend { provider: String, message: String },

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("{operation} was cancelled by the caller")]
    Cancelled { operation: String },

    #[error("Quota exceeded for {action}: {used}/{limit} used")]
    QuotaExceeded {
        action: String,
        limit: u64,
        used: u64,
        resets_at: Option<DateTime<Utc>>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl Error {
    pub fn credentials_missing(provider: impl Into<String>) -> Self {
        Error::CredentialsMissing {
            provider: provider.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn backend(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(config::ConfigError::Message(msg.into()))
    }

    /// Whether the error reflects backend health and should trip a circuit breaker.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_classification() {
        assert!(Error::backend("openai", "500").is_backend_failure());
        assert!(Error::timeout("poll", Duration::from_secs(1)).is_backend_failure());
        assert!(!Error::credentials_missing("openai").is_backend_failure());
        assert!(!Error::invalid_request("no model").is_backend_failure());
    }

    #[test]
    fn test_error_messages_name_the_provider() {
        let err = Error::credentials_missing("anthropic");
        assert!(err.to_string().contains("anthropic"));

        let err = Error::BackendUnavailable {
            service: "openai:chat".to_string(),
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.to_string(), "Backend 'openai:chat' is unavailable, retry after 12s");
    }
}
