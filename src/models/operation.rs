//! Long-running backend operations.
//!
//! Adapters only submit jobs and report status; the caller drives polling so
//! the wait is bounded by attempt count, a time budget and a cancellation token.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::FixedInterval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Reference to a job accepted by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationHandle {
    pub provider: String,
    pub model: String,
    pub id: String,
    pub submitted_at: DateTime<Utc>,
}

impl OperationHandle {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            id: id.into(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub enum OperationStatus<T> {
    Ready(T),
    Pending,
    Failed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 60,
        }
    }
}

/// Poll until the operation resolves, the attempts run out, the budget
/// elapses or `cancel` fires. Sleeps one interval before each poll.
pub async fn drive<T, F, Fut>(
    name: &str,
    policy: PollPolicy,
    budget: Duration,
    cancel: &CancellationToken,
    mut poll: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<OperationStatus<T>>>,
{
    let attempts = async {
        let schedule = FixedInterval::new(policy.interval).take(policy.max_attempts as usize);
        for (index, delay) in schedule.enumerate() {
            let attempt = index as u32 + 1;

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Operation {} cancelled before attempt {}", name, attempt);
                    return Err(Error::Cancelled { operation: name.to_string() });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match poll(attempt).await? {
                OperationStatus::Ready(value) => {
                    debug!("Operation {} ready after {} attempts", name, attempt);
                    return Ok(value);
                }
                OperationStatus::Failed(error) => {
                    warn!("Operation {} failed on attempt {}: {}", name, attempt, error);
                    return Err(error);
                }
                OperationStatus::Pending => {
                    debug!("Operation {} pending ({}/{})", name, attempt, policy.max_attempts);
                }
            }
        }

        Err(Error::timeout(
            format!("{} after {} polls", name, policy.max_attempts),
            policy.interval * policy.max_attempts,
        ))
    };

    match tokio::time::timeout(budget, attempts).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(name, budget)),
    }
}
