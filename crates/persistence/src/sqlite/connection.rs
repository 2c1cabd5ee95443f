//! Database connection and initialization

use coinalert_core::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database wrapper for SQLite operations
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to database at the given path, creating if necessary
    pub async fn connect(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::DatabaseError(e.to_string()))?;
        }

        let path_str = path.to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| Error::DatabaseError(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::DatabaseError(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        info!("Database ready at {}", path_str);
        Ok(db)
    }

    /// Connect to in-memory database (for testing)
    pub async fn connect_in_memory() -> Result<Self> {
        // A single connection that never recycles, so the in-memory data lives
        // as long as the pool
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::DatabaseError(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                alert_threshold REAL NOT NULL,
                coin_filter_mode TEXT NOT NULL DEFAULT 'all',
                coin_whitelist TEXT,
                phases TEXT,
                ignore_bad_seconds INTEGER NOT NULL DEFAULT 0,
                ignore_positive_seconds INTEGER NOT NULL DEFAULT 0,
                ignore_alert_seconds INTEGER NOT NULL DEFAULT 0,
                max_log_entries_per_coin_negative INTEGER NOT NULL DEFAULT 0,
                max_log_entries_per_coin_positive INTEGER NOT NULL DEFAULT 0,
                max_log_entries_per_coin_alert INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                future_minutes INTEGER NOT NULL,
                price_change_percent REAL NOT NULL,
                target_direction TEXT NOT NULL DEFAULT 'up',
                send_alerts_to_webhook INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL,
                coin_id TEXT NOT NULL,
                tick_id INTEGER,
                probability REAL NOT NULL,
                tag TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                prediction_timestamp INTEGER,
                evaluation_timestamp INTEGER NOT NULL,
                target_direction TEXT NOT NULL,
                price_change_percent REAL NOT NULL,
                price_at_prediction REAL,
                evaluation_result TEXT,
                actual_price_change_pct REAL,
                ath_highest_pct REAL,
                ath_lowest_pct REAL,
                ath_timestamp INTEGER,
                evaluated_at INTEGER,
                evaluation_attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER,
                claimed_at INTEGER,
                claimed_by INTEGER,
                FOREIGN KEY (model_id) REFERENCES models(id)
            );

            CREATE INDEX IF NOT EXISTS idx_predictions_due
                ON predictions (status, evaluation_timestamp);

            CREATE INDEX IF NOT EXISTS idx_predictions_model_coin
                ON predictions (model_id, coin_id, tag, status);

            CREATE TABLE IF NOT EXISTS coin_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                coin_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                phase INTEGER,
                price REAL,
                scores TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_coin_metrics_coin_time
                ON coin_metrics (coin_id, timestamp);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

        // Existing databases predate claim owners (idempotent)
        let _ = sqlx::query("ALTER TABLE predictions ADD COLUMN claimed_by INTEGER")
            .execute(&self.pool)
            .await;

        // One entry per (model, tick): keep the oldest of any duplicates
        let deduped = crate::sqlite::deduplicate_tick_predictions(&self.pool).await?;
        if deduped > 0 {
            info!("Migration: removed {} duplicate tick predictions", deduped);
        }

        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_predictions_model_tick
               ON predictions (model_id, tick_id)"#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
