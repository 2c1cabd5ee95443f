//! Model configuration persistence operations

use coinalert_core::{Error, Model, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeSet;

/// Model configuration stored in database
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ModelRow {
    pub id: i64,
    pub name: String,
    pub alert_threshold: f64,
    pub coin_filter_mode: String,
    /// JSON array of coin ids
    pub coin_whitelist: Option<String>,
    /// JSON array of phase numbers
    pub phases: Option<String>,
    pub ignore_bad_seconds: i64,
    pub ignore_positive_seconds: i64,
    pub ignore_alert_seconds: i64,
    pub max_log_entries_per_coin_negative: i64,
    pub max_log_entries_per_coin_positive: i64,
    pub max_log_entries_per_coin_alert: i64,
    pub is_active: bool,
    pub future_minutes: i64,
    pub price_change_percent: f64,
    pub target_direction: String,
    pub send_alerts_to_webhook: bool,
}

impl TryFrom<ModelRow> for Model {
    type Error = Error;

    fn try_from(row: ModelRow) -> Result<Self> {
        let integrity = |e: Error| Error::IntegrityError(format!("model {}: {}", row.id, e));

        let coin_whitelist = row
            .coin_whitelist
            .as_deref()
            .map(serde_json::from_str::<BTreeSet<String>>)
            .transpose()
            .map_err(|e| integrity(e.into()))?;
        let phases = row
            .phases
            .as_deref()
            .map(serde_json::from_str::<BTreeSet<u8>>)
            .transpose()
            .map_err(|e| integrity(e.into()))?;

        Ok(Model {
            id: row.id,
            name: row.name.clone(),
            alert_threshold: row.alert_threshold,
            coin_filter_mode: row.coin_filter_mode.parse().map_err(integrity)?,
            coin_whitelist,
            phases,
            ignore_bad_seconds: non_negative(row.ignore_bad_seconds),
            ignore_positive_seconds: non_negative(row.ignore_positive_seconds),
            ignore_alert_seconds: non_negative(row.ignore_alert_seconds),
            max_log_entries_per_coin_negative: non_negative(row.max_log_entries_per_coin_negative) as u32,
            max_log_entries_per_coin_positive: non_negative(row.max_log_entries_per_coin_positive) as u32,
            max_log_entries_per_coin_alert: non_negative(row.max_log_entries_per_coin_alert) as u32,
            is_active: row.is_active,
            future_minutes: non_negative(row.future_minutes) as u32,
            price_change_percent: row.price_change_percent,
            target_direction: row.target_direction.parse().map_err(integrity)?,
            send_alerts_to_webhook: row.send_alerts_to_webhook,
        })
    }
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

fn encode_set<T: Serialize>(set: &Option<BTreeSet<T>>) -> Result<Option<String>> {
    set.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::from)
}

const MODEL_COLUMNS: &str = r#"
    id, name, alert_threshold, coin_filter_mode, coin_whitelist, phases,
    ignore_bad_seconds, ignore_positive_seconds, ignore_alert_seconds,
    max_log_entries_per_coin_negative, max_log_entries_per_coin_positive,
    max_log_entries_per_coin_alert, is_active, future_minutes,
    price_change_percent, target_direction, send_alerts_to_webhook
"#;

/// Create a new model and return its id
pub async fn create_model(pool: &SqlitePool, model: &Model) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO models (name, alert_threshold, coin_filter_mode, coin_whitelist, phases,
                            ignore_bad_seconds, ignore_positive_seconds, ignore_alert_seconds,
                            max_log_entries_per_coin_negative, max_log_entries_per_coin_positive,
                            max_log_entries_per_coin_alert, is_active, future_minutes,
                            price_change_percent, target_direction, send_alerts_to_webhook)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&model.name)
    .bind(model.alert_threshold)
    .bind(model.coin_filter_mode.as_str())
    .bind(encode_set(&model.coin_whitelist)?)
    .bind(encode_set(&model.phases)?)
    .bind(model.ignore_bad_seconds as i64)
    .bind(model.ignore_positive_seconds as i64)
    .bind(model.ignore_alert_seconds as i64)
    .bind(model.max_log_entries_per_coin_negative)
    .bind(model.max_log_entries_per_coin_positive)
    .bind(model.max_log_entries_per_coin_alert)
    .bind(model.is_active)
    .bind(model.future_minutes)
    .bind(model.price_change_percent)
    .bind(model.target_direction.as_str())
    .bind(model.send_alerts_to_webhook)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.last_insert_rowid())
}

/// Overwrite every configurable field of an existing model
pub async fn update_model(pool: &SqlitePool, model: &Model) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE models
        SET name = ?, alert_threshold = ?, coin_filter_mode = ?, coin_whitelist = ?, phases = ?,
            ignore_bad_seconds = ?, ignore_positive_seconds = ?, ignore_alert_seconds = ?,
            max_log_entries_per_coin_negative = ?, max_log_entries_per_coin_positive = ?,
            max_log_entries_per_coin_alert = ?, is_active = ?, future_minutes = ?,
            price_change_percent = ?, target_direction = ?, send_alerts_to_webhook = ?,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(&model.name)
    .bind(model.alert_threshold)
    .bind(model.coin_filter_mode.as_str())
    .bind(encode_set(&model.coin_whitelist)?)
    .bind(encode_set(&model.phases)?)
    .bind(model.ignore_bad_seconds as i64)
    .bind(model.ignore_positive_seconds as i64)
    .bind(model.ignore_alert_seconds as i64)
    .bind(model.max_log_entries_per_coin_negative)
    .bind(model.max_log_entries_per_coin_positive)
    .bind(model.max_log_entries_per_coin_alert)
    .bind(model.is_active)
    .bind(model.future_minutes)
    .bind(model.price_change_percent)
    .bind(model.target_direction.as_str())
    .bind(model.send_alerts_to_webhook)
    .bind(model.id)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    if result.rows_affected() == 0 {
        return Err(Error::ModelNotFound(model.id));
    }

    Ok(())
}

/// Get a specific model by ID
pub async fn get_model(pool: &SqlitePool, model_id: i64) -> Result<Option<Model>> {
    let row = sqlx::query_as::<_, ModelRow>(&format!(
        "SELECT {} FROM models WHERE id = ?",
        MODEL_COLUMNS
    ))
    .bind(model_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    row.map(Model::try_from).transpose()
}

/// Get all models, optionally only the active ones
pub async fn list_models(pool: &SqlitePool, active_only: bool) -> Result<Vec<Model>> {
    let mut query = format!("SELECT {} FROM models", MODEL_COLUMNS);
    if active_only {
        query.push_str(" WHERE is_active = 1");
    }
    query.push_str(" ORDER BY id");

    let rows = sqlx::query_as::<_, ModelRow>(&query)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    rows.into_iter().map(Model::try_from).collect()
}
