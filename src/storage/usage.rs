use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::database::decimal_helpers;

/// Outcome recorded for an executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Completed,
    /// The caller cancelled a stream after some output was delivered.
    Cancelled,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Completed => "completed",
            UsageStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(UsageStatus::Completed),
            "cancelled" => Ok(UsageStatus::Cancelled),
            other => Err(Error::Database(sqlx::Error::Decode(
                format!("Unknown usage status '{}'", other).into(),
            ))),
        }
    }
}

/// Metadata supplied when an action is recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
    pub latency_ms: u64,
    pub status: Option<UsageStatus>,
}

/// One immutable ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub caller_id: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
    pub latency_ms: u64,
    pub status: UsageStatus,
}

impl UsageRecord {
    pub fn new(caller_id: &str, action: &str, timestamp: DateTime<Utc>, meta: UsageMetadata) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            caller_id: caller_id.to_string(),
            timestamp,
            action_type: action.to_string(),
            provider: meta.provider,
            model: meta.model,
            input_tokens: meta.input_tokens,
            output_tokens: meta.output_tokens,
            cost: meta.cost,
            latency_ms: meta.latency_ms,
            status: meta.status.unwrap_or(UsageStatus::Completed),
        }
    }
}

/// Rows counted for one caller/action, optionally restricted to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowCount {
    pub count: u64,
    /// Oldest row inside the window; determines when the window frees a slot.
    pub oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStatistics {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: Decimal,
    pub by_provider: HashMap<String, ProviderUsage>,
    pub by_model: HashMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub provider: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
}

impl UsageStatistics {
    fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut stats = UsageStatistics::default();
        for record in records {
            stats.total_requests += 1;
            stats.total_input_tokens += record.input_tokens as u64;
            stats.total_output_tokens += record.output_tokens as u64;
            stats.total_cost += record.cost;

            let provider = stats.by_provider.entry(record.provider.clone()).or_default();
            provider.requests += 1;
            provider.input_tokens += record.input_tokens as u64;
            provider.output_tokens += record.output_tokens as u64;
            provider.cost += record.cost;

            let model = stats.by_model.entry(record.model.clone()).or_default();
            model.provider = record.provider.clone();
            model.requests += 1;
            model.input_tokens += record.input_tokens as u64;
            model.output_tokens += record.output_tokens as u64;
            model.cost += record.cost;
        }
        stats
    }
}

/// Append-only usage ledger.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<()>;

    /// Count rows for `caller`/`action` strictly newer than `since` (all rows when `None`).
    async fn count(&self, caller_id: &str, action: &str, since: Option<DateTime<Utc>>) -> Result<WindowCount>;

    /// Most recent rows first.
    async fn recent(&self, caller_id: &str, limit: usize) -> Result<Vec<UsageRecord>>;

    async fn statistics(&self, caller_id: Option<&str>, since: Option<DateTime<Utc>>) -> Result<UsageStatistics>;
}

/// SQLite-backed ledger; the schema rejects UPDATE and DELETE.
pub struct UsageRepository {
    pool: SqlitePool,
}

impl UsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<UsageRecord> {
        let timestamp_ms: i64 = row.get("timestamp_ms");
        let cost: String = row.get("cost");
        let status: String = row.get("status");
        let input_tokens: i64 = row.get("input_tokens");
        let output_tokens: i64 = row.get("output_tokens");
        let latency_ms: i64 = row.get("latency_ms");

        Ok(UsageRecord {
            request_id: row.get("request_id"),
            caller_id: row.get("caller_id"),
            timestamp: millis_to_datetime(timestamp_ms)?,
            action_type: row.get("action_type"),
            provider: row.get("provider"),
            model: row.get("model"),
            input_tokens: input_tokens.max(0) as u32,
            output_tokens: output_tokens.max(0) as u32,
            cost: decimal_helpers::string_to_decimal(&cost)?,
            latency_ms: latency_ms.max(0) as u64,
            status: UsageStatus::parse(&status)?,
        })
    }
}

#[async_trait]
impl UsageLedger for UsageRepository {
    async fn append(&self, record: UsageRecord) -> Result<()> {
        debug!(
            "Recording usage: caller={}, action={}, provider={}, model={}, tokens={}/{}",
            record.caller_id, record.action_type, record.provider, record.model,
            record.input_tokens, record.output_tokens
        );

        sqlx::query(
            r#"
            INSERT INTO usage_records (
                request_id, caller_id, timestamp_ms, action_type, provider, model,
                input_tokens, output_tokens, cost, latency_ms, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.request_id)
        .bind(&record.caller_id)
        .bind(record.timestamp.timestamp_millis())
        .bind(&record.action_type)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(decimal_helpers::decimal_to_string(record.cost))
        .bind(record.latency_ms as i64)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count(&self, caller_id: &str, action: &str, since: Option<DateTime<Utc>>) -> Result<WindowCount> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count, MIN(timestamp_ms) AS oldest
            FROM usage_records
            WHERE caller_id = ? AND action_type = ? AND timestamp_ms > ?
            "#,
        )
        .bind(caller_id)
        .bind(action)
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        let oldest: Option<i64> = row.get("oldest");

        Ok(WindowCount {
            count: count.max(0) as u64,
            oldest: oldest.map(millis_to_datetime).transpose()?,
        })
    }

    async fn recent(&self, caller_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM usage_records WHERE caller_id = ? ORDER BY timestamp_ms DESC, id DESC LIMIT ?",
        )
        .bind(caller_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn statistics(&self, caller_id: Option<&str>, since: Option<DateTime<Utc>>) -> Result<UsageStatistics> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);

        // Costs are stored as decimal text, so aggregation happens here rather than in SQL.
        let rows = match caller_id {
            Some(caller) => {
                sqlx::query("SELECT * FROM usage_records WHERE caller_id = ? AND timestamp_ms > ?")
                    .bind(caller)
                    .bind(since_ms)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM usage_records WHERE timestamp_ms > ?")
                    .bind(since_ms)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let records = rows.iter().map(Self::row_to_record).collect::<Result<Vec<_>>>()?;
        Ok(UsageStatistics::from_records(&records))
    }
}

/// In-memory ledger for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryUsageLedger {
    records: RwLock<Vec<UsageRecord>>,
}

impl MemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn append(&self, record: UsageRecord) -> Result<()> {
        self.records.write().push(record);
        Ok(())
    }

    async fn count(&self, caller_id: &str, action: &str, since: Option<DateTime<Utc>>) -> Result<WindowCount> {
        let records = self.records.read();
        let matching = records.iter().filter(|r| {
            r.caller_id == caller_id
                && r.action_type == action
                && since.map_or(true, |s| r.timestamp > s)
        });

        let mut window = WindowCount::default();
        for record in matching {
            window.count += 1;
            window.oldest = Some(match window.oldest {
                Some(oldest) if oldest <= record.timestamp => oldest,
                _ => record.timestamp,
            });
        }
        Ok(window)
    }

    async fn recent(&self, caller_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        let records = self.records.read();
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.caller_id == caller_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn statistics(&self, caller_id: Option<&str>, since: Option<DateTime<Utc>>) -> Result<UsageStatistics> {
        let records = self.records.read();
        Ok(UsageStatistics::from_records(records.iter().filter(|r| {
            caller_id.map_or(true, |c| r.caller_id == c) && since.map_or(true, |s| r.timestamp > s)
        })))
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        Error::Database(sqlx::Error::Decode(format!("Invalid timestamp: {}", ms).into()))
    })
}
