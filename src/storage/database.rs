use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, SqlitePool};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Schema migrations, applied in order and tracked in `app_settings`.
const MIGRATIONS: &[(i32, &str, &str)] = &[(
    1,
    "001_usage_ledger",
    include_str!("../../migrations/001_usage_ledger.sql"),
)];

/// Database connection manager with migration support
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn open(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {:?}", db_path);

        let database_url = format!("sqlite:{}", db_path.display());
        if !db_path.exists() {
            info!("Database doesn't exist, creating new database");
            sqlx::Sqlite::create_database(&database_url).await?;
        }

        let pool = SqlitePool::connect(&format!("{}?mode=rwc", database_url)).await?;
        let db = Self { pool };
        db.run_migrations().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on the same schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn get_pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_database_version().await?;
        debug!("Current database version: {}", current_version);

        for (number, name, sql) in MIGRATIONS {
            if *number <= current_version {
                debug!("Skipping migration {} (already applied)", name);
                continue;
            }

            info!("Applying migration: {}", name);
            sqlx::query(sql).execute(&self.pool).await.map_err(|e| {
                error!("Failed to apply migration {}: {}", name, e);
                Error::Database(e)
            })?;

            self.update_database_version(*number).await?;
        }

        Ok(())
    }

    async fn get_database_version(&self) -> Result<i32> {
        let table_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='app_settings'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if !table_exists {
            return Ok(0);
        }

        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = 'database_version'")
                .fetch_optional(&self.pool)
                .await?;

        match version {
            Some(version_str) => version_str.parse().map_err(|e| {
                Error::Database(sqlx::Error::Decode(
                    format!("Invalid database version: {}", e).into(),
                ))
            }),
            None => Ok(0),
        }
    }

    async fn update_database_version(&self, version: i32) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES ('database_version', ?, unixepoch())",
        )
        .bind(version.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn verify_integrity(&self) -> Result<bool> {
        let integrity_result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;

        let is_ok = integrity_result == "ok";
        if !is_ok {
            error!("Database integrity check failed: {}", integrity_result);
        }
        Ok(is_ok)
    }
}

/// Helper functions for working with decimal values in the database
pub mod decimal_helpers {
    use crate::error::{Error, Result};
    use rust_decimal::Decimal;

    pub fn decimal_to_string(decimal: Decimal) -> String {
        decimal.to_string()
    }

    pub fn string_to_decimal(s: &str) -> Result<Decimal> {
        s.parse().map_err(|e| {
            Error::Database(sqlx::Error::Decode(
                format!("Failed to parse decimal from string '{}': {}", s, e).into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_database_migrates_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gate.db");

        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.get_database_version().await.unwrap(), 1);
        db.pool().close().await;

        // Reopening must not re-run the migration
        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.get_database_version().await.unwrap(), 1);
        assert!(db.verify_integrity().await.unwrap());
    }

    #[tokio::test]
    async fn test_ledger_rejects_updates() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO usage_records (request_id, caller_id, timestamp_ms, action_type, provider, model, status) \
             VALUES ('r1', 'c1', 0, 'chat', 'openai', 'gpt-4o', 'completed')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let update = sqlx::query("UPDATE usage_records SET caller_id = 'c2'")
            .execute(db.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM usage_records").execute(db.pool()).await;
        assert!(delete.is_err());
    }

    #[test]
    fn test_decimal_helpers() {
        use decimal_helpers::*;

        let decimal = Decimal::new(12345, 2);
        let string = decimal_to_string(decimal);
        assert_eq!(string, "123.45");
        assert_eq!(string_to_decimal(&string).unwrap(), decimal);
        assert!(string_to_decimal("abc").is_err());
    }
}
