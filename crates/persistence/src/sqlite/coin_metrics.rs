//! Coin metric rows: the polled tick feed and the price history

use super::timestamps::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use coinalert_core::{Error, PricePoint, Result, Tick, TickPage};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::warn;

/// Coin metric observation stored in database
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CoinMetricRow {
    pub id: i64,
    pub coin_id: String,
    pub timestamp: i64,
    pub phase: Option<i64>,
    pub price: Option<f64>,
    /// JSON object of model id -> probability
    pub scores: String,
}

impl TryFrom<CoinMetricRow> for Tick {
    type Error = Error;

    fn try_from(row: CoinMetricRow) -> Result<Self> {
        let scores: BTreeMap<i64, f64> = serde_json::from_str(&row.scores)
            .map_err(|e| Error::IntegrityError(format!("coin metric {}: {}", row.id, e)))?;
        let phase = row
            .phase
            .map(u8::try_from)
            .transpose()
            .map_err(|_| Error::IntegrityError(format!("coin metric {} has an invalid phase", row.id)))?;

        Ok(Tick {
            id: row.id,
            coin_id: row.coin_id,
            timestamp: from_millis(row.timestamp)?,
            phase,
            price: row.price,
            scores,
        })
    }
}

/// Store a coin metric observation and return its id
pub async fn insert_coin_metric(
    pool: &SqlitePool,
    coin_id: &str,
    timestamp: DateTime<Utc>,
    phase: Option<u8>,
    price: Option<f64>,
    scores: &BTreeMap<i64, f64>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO coin_metrics (coin_id, timestamp, phase, price, scores)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(coin_id)
    .bind(to_millis(timestamp))
    .bind(phase)
    .bind(price)
    .bind(serde_json::to_string(scores)?)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.last_insert_rowid())
}

/// Observations with `id > after_id`, oldest first. Undecodable rows are
/// logged and skipped so one bad row never pins the cursor.
pub async fn get_coin_metrics_after(pool: &SqlitePool, after_id: i64, limit: u32) -> Result<TickPage> {
    let rows = sqlx::query_as::<_, CoinMetricRow>(
        r#"
        SELECT id, coin_id, timestamp, phase, price, scores
        FROM coin_metrics
        WHERE id > ?
        ORDER BY id
        LIMIT ?
        "#,
    )
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    let mut page = TickPage {
        last_id: rows.last().map(|row| row.id),
        ..TickPage::default()
    };
    for row in rows {
        match Tick::try_from(row) {
            Ok(tick) => page.ticks.push(tick),
            Err(e) => {
                warn!("Skipping coin metric: {}", e);
                page.skipped += 1;
            }
        }
    }

    Ok(page)
}

/// Priced observations of a coin inside `[from, to]`, ordered by time
pub async fn get_price_series(
    pool: &SqlitePool,
    coin_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<PricePoint>> {
    let rows: Vec<(i64, f64)> = sqlx::query_as(
        r#"
        SELECT timestamp, price
        FROM coin_metrics
        WHERE coin_id = ? AND timestamp >= ? AND timestamp <= ? AND price IS NOT NULL
        ORDER BY timestamp, id
        "#,
    )
    .bind(coin_id)
    .bind(to_millis(from))
    .bind(to_millis(to))
    .fetch_all(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    rows.into_iter()
        .map(|(ts, price)| Ok(PricePoint::new(from_millis(ts)?, price)))
        .collect()
}
