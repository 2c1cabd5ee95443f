//! Prediction log persistence operations

use super::timestamps::{from_millis, from_millis_opt, to_millis};
use chrono::{DateTime, Utc};
use coinalert_core::{
    Error, Evaluation, EvaluationResult, NewPrediction, OutcomeBucket, Prediction,
    PredictionQuery, PredictionStatus, Result, Tag,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

/// Prediction record stored in database
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PredictionRow {
    pub id: i64,
    pub model_id: i64,
    pub coin_id: String,
    pub tick_id: Option<i64>,
    pub probability: f64,
    pub tag: String,
    pub status: String,
    pub prediction_timestamp: Option<i64>,
    pub evaluation_timestamp: i64,
    pub target_direction: String,
    pub price_change_percent: f64,
    pub price_at_prediction: Option<f64>,
    pub evaluation_result: Option<String>,
    pub actual_price_change_pct: Option<f64>,
    pub ath_highest_pct: Option<f64>,
    pub ath_lowest_pct: Option<f64>,
    pub ath_timestamp: Option<i64>,
    pub evaluated_at: Option<i64>,
    pub evaluation_attempts: i64,
}

impl TryFrom<PredictionRow> for Prediction {
    type Error = Error;

    /// Unknown enum strings or a missing prediction timestamp are integrity
    /// violations; they are surfaced, never normalized.
    fn try_from(row: PredictionRow) -> Result<Self> {
        let id = row.id;
        let integrity = |e: Error| Error::IntegrityError(format!("prediction {}: {}", id, e));

        let prediction_timestamp = row.prediction_timestamp.ok_or_else(|| {
            Error::IntegrityError(format!("prediction {} has no prediction_timestamp", id))
        })?;

        let prediction = Prediction {
            id,
            model_id: row.model_id,
            coin_id: row.coin_id,
            probability: row.probability,
            tag: row.tag.parse().map_err(integrity)?,
            status: row.status.parse().map_err(integrity)?,
            prediction_timestamp: from_millis(prediction_timestamp)?,
            evaluation_timestamp: from_millis(row.evaluation_timestamp)?,
            target_direction: row.target_direction.parse().map_err(integrity)?,
            price_change_percent: row.price_change_percent,
            price_at_prediction: row.price_at_prediction,
            tick_id: row.tick_id,
            evaluation_result: row
                .evaluation_result
                .as_deref()
                .map(str::parse::<EvaluationResult>)
                .transpose()
                .map_err(integrity)?,
            actual_price_change_pct: row.actual_price_change_pct,
            ath_highest_pct: row.ath_highest_pct,
            ath_lowest_pct: row.ath_lowest_pct,
            ath_timestamp: from_millis_opt(row.ath_timestamp)?,
            evaluated_at: from_millis_opt(row.evaluated_at)?,
            evaluation_attempts: row.evaluation_attempts.max(0) as u32,
        };

        prediction.check_integrity()?;
        Ok(prediction)
    }
}

const PREDICTION_COLUMNS: &str = r#"
    id, model_id, coin_id, tick_id, probability, tag, status,
    prediction_timestamp, evaluation_timestamp, target_direction,
    price_change_percent, price_at_prediction, evaluation_result,
    actual_price_change_pct, ath_highest_pct, ath_lowest_pct,
    ath_timestamp, evaluated_at, evaluation_attempts
"#;

/// Insert a prediction unless the (model, coin, tag) already holds `cap`
/// pending entries. The count and the insert run as one statement.
///
/// Returns the new id, or `None` when the cap suppressed the insert or the
/// model already has an entry for the same tick.
pub async fn insert_prediction_capped(
    pool: &SqlitePool,
    prediction: &NewPrediction,
    cap: u32,
) -> Result<Option<i64>> {
    let result = sqlx::query(
        r#"
        INSERT INTO predictions (model_id, coin_id, tick_id, probability, tag, status,
                                 prediction_timestamp, evaluation_timestamp,
                                 target_direction, price_change_percent, price_at_prediction)
        SELECT ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?
        WHERE ? = 0 OR (
            SELECT COUNT(*) FROM predictions
            WHERE model_id = ? AND coin_id = ? AND tag = ?
              AND status IN ('active', 'evaluating')
        ) < ?
        ON CONFLICT (model_id, tick_id) DO NOTHING
        "#,
    )
    .bind(prediction.model_id)
    .bind(&prediction.coin_id)
    .bind(prediction.tick_id)
    .bind(prediction.probability)
    .bind(prediction.tag.as_str())
    .bind(to_millis(prediction.prediction_timestamp))
    .bind(to_millis(prediction.evaluation_timestamp))
    .bind(prediction.target_direction.as_str())
    .bind(prediction.price_change_percent)
    .bind(prediction.price_at_prediction)
    .bind(cap)
    .bind(prediction.model_id)
    .bind(&prediction.coin_id)
    .bind(prediction.tag.as_str())
    .bind(cap)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    if result.rows_affected() == 0 {
        debug!(
            "Skipped model {} / {} / {}: log cap {} reached or tick {:?} already recorded",
            prediction.model_id, prediction.coin_id, prediction.tag, cap, prediction.tick_id
        );
        return Ok(None);
    }

    Ok(Some(result.last_insert_rowid()))
}

/// Get a specific prediction by ID
pub async fn get_prediction(pool: &SqlitePool, prediction_id: i64) -> Result<Prediction> {
    let row = sqlx::query_as::<_, PredictionRow>(&format!(
        "SELECT {} FROM predictions WHERE id = ?",
        PREDICTION_COLUMNS
    ))
    .bind(prediction_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    row.ok_or(Error::PredictionNotFound(prediction_id))?
        .try_into()
}

/// Get predictions with optional filters, newest first
pub async fn list_predictions(pool: &SqlitePool, query: &PredictionQuery) -> Result<Vec<Prediction>> {
    let mut sql = format!("SELECT {} FROM predictions WHERE 1 = 1", PREDICTION_COLUMNS);

    if query.active_model_id.is_some() {
        sql.push_str(" AND model_id = ?");
    }
    if query.tag.is_some() {
        sql.push_str(" AND tag = ?");
    }
    match query.status {
        Some(PredictionStatus::Active) => sql.push_str(" AND status IN ('active', 'evaluating')"),
        Some(_) => sql.push_str(" AND status = ?"),
        None => {}
    }
    if query.coin_id.is_some() {
        sql.push_str(" AND coin_id = ?");
    }

    sql.push_str(" ORDER BY prediction_timestamp DESC, id DESC LIMIT ? OFFSET ?");

    let mut builder = sqlx::query_as::<_, PredictionRow>(&sql);

    if let Some(model_id) = query.active_model_id {
        builder = builder.bind(model_id);
    }
    if let Some(tag) = query.tag {
        builder = builder.bind(tag.as_str());
    }
    if let Some(status) = query.status.filter(|s| *s != PredictionStatus::Active) {
        builder = builder.bind(status.as_str());
    }
    if let Some(coin_id) = &query.coin_id {
        builder = builder.bind(coin_id);
    }

    let rows = builder
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    rows.into_iter().map(Prediction::try_from).collect()
}

/// Ids of active predictions whose evaluation instant has passed
pub async fn get_due_prediction_ids(pool: &SqlitePool, now: DateTime<Utc>, limit: u32) -> Result<Vec<i64>> {
    let now_ms = to_millis(now);
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM predictions
        WHERE status = 'active'
          AND evaluation_timestamp <= ?
          AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
        ORDER BY evaluation_timestamp
        LIMIT ?
        "#,
    )
    .bind(now_ms)
    .bind(now_ms)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Compare-and-set `active -> evaluating` under `token`. Exactly one caller wins.
pub async fn claim_prediction(
    pool: &SqlitePool,
    prediction_id: i64,
    now: DateTime<Utc>,
    token: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE predictions
        SET status = 'evaluating', claimed_at = ?, claimed_by = ?
        WHERE id = ? AND status = 'active'
        "#,
    )
    .bind(to_millis(now))
    .bind(token)
    .bind(prediction_id)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.rows_affected() == 1)
}

/// Claim every due prediction this caller manages to win
pub async fn claim_due(pool: &SqlitePool, now: DateTime<Utc>, limit: u32, token: i64) -> Result<Vec<i64>> {
    let mut claimed = Vec::new();
    for id in get_due_prediction_ids(pool, now, limit).await? {
        if claim_prediction(pool, id, now, token).await? {
            claimed.push(id);
        }
    }
    Ok(claimed)
}

/// Move the claim time forward while `token` still owns the claim
pub async fn renew_claim(pool: &SqlitePool, prediction_id: i64, token: i64, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE predictions
        SET claimed_at = ?
        WHERE id = ? AND status = 'evaluating' AND claimed_by = ?
        "#,
    )
    .bind(to_millis(now))
    .bind(prediction_id)
    .bind(token)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.rows_affected() == 1)
}

/// Return a claim to `active` after a transient failure, counting the attempt
pub async fn release_claim(
    pool: &SqlitePool,
    prediction_id: i64,
    token: i64,
    retry_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE predictions
        SET status = 'active', claimed_at = NULL, claimed_by = NULL, next_attempt_at = ?,
            evaluation_attempts = evaluation_attempts + 1
        WHERE id = ? AND status = 'evaluating' AND claimed_by = ?
        "#,
    )
    .bind(to_millis(retry_at))
    .bind(prediction_id)
    .bind(token)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(())
}

/// Write the terminal outcome of a prediction claimed under `token`
pub async fn finalize_prediction(
    pool: &SqlitePool,
    prediction_id: i64,
    token: i64,
    evaluation: &Evaluation,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE predictions
        SET status = 'inactive', evaluation_result = ?, actual_price_change_pct = ?,
            ath_highest_pct = ?, ath_lowest_pct = ?, ath_timestamp = ?,
            evaluated_at = ?, claimed_at = NULL, claimed_by = NULL, next_attempt_at = NULL
        WHERE id = ? AND status = 'evaluating' AND claimed_by = ?
        "#,
    )
    .bind(evaluation.result.as_str())
    .bind(evaluation.actual_price_change_pct)
    .bind(evaluation.ath_highest_pct)
    .bind(evaluation.ath_lowest_pct)
    .bind(evaluation.ath_timestamp.map(to_millis))
    .bind(to_millis(now))
    .bind(prediction_id)
    .bind(token)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.rows_affected() == 1)
}

/// Return claims abandoned by a crashed or stalled worker to `active`.
/// The old owner's token no longer matches afterwards.
pub async fn release_stale_claims(pool: &SqlitePool, claimed_before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE predictions
        SET status = 'active', claimed_at = NULL, claimed_by = NULL
        WHERE status = 'evaluating' AND (claimed_at IS NULL OR claimed_at < ?)
        "#,
    )
    .bind(to_millis(claimed_before))
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.rows_affected())
}

/// Drop repeated (model, tick) entries, keeping the oldest
pub async fn deduplicate_tick_predictions(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM predictions
        WHERE tick_id IS NOT NULL
          AND id NOT IN (
            SELECT MIN(id) FROM predictions
            WHERE tick_id IS NOT NULL
            GROUP BY model_id, tick_id
          )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.rows_affected())
}

/// Delete every prediction of a model (the model itself is untouched)
pub async fn delete_predictions_for_model(pool: &SqlitePool, model_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM predictions WHERE model_id = ?")
        .bind(model_id)
        .execute(pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(result.rows_affected())
}

/// Group a model's predictions by tag, status and result for statistics
pub async fn get_outcome_buckets(pool: &SqlitePool, model_id: i64) -> Result<Vec<OutcomeBucket>> {
    let rows: Vec<(String, String, Option<String>, i64, f64)> = sqlx::query_as(
        r#"
        SELECT tag, status, evaluation_result, COUNT(*),
               CAST(COALESCE(SUM(actual_price_change_pct), 0) AS REAL)
        FROM predictions
        WHERE model_id = ?
        GROUP BY tag, status, evaluation_result
        "#,
    )
    .bind(model_id)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    rows.into_iter()
        .map(|(tag, status, result, count, sum)| {
            let integrity = |e: Error| Error::IntegrityError(format!("model {}: {}", model_id, e));
            Ok(OutcomeBucket {
                tag: tag.parse::<Tag>().map_err(integrity)?,
                status: status.parse::<PredictionStatus>().map_err(integrity)?,
                result: result
                    .as_deref()
                    .map(str::parse::<EvaluationResult>)
                    .transpose()
                    .map_err(integrity)?,
                count: count.max(0) as u64,
                sum_change_pct: sum,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::{new_prediction, seeded_db};
    use chrono::Duration;

    const TOKEN: i64 = 11;

    #[tokio::test]
    async fn test_cap_keeps_only_first_alert() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();

        let first = new_prediction(&model, "C", 0.9, Tag::Alert, now);
        let second = new_prediction(&model, "C", 0.95, Tag::Alert, now + Duration::seconds(1));

        assert!(insert_prediction_capped(db.pool(), &first, 1).await.unwrap().is_some());
        assert!(insert_prediction_capped(db.pool(), &second, 1).await.unwrap().is_none());

        // other coins and tags are unaffected
        let other_coin = new_prediction(&model, "D", 0.9, Tag::Alert, now);
        assert!(insert_prediction_capped(db.pool(), &other_coin, 1).await.unwrap().is_some());
        let positive = new_prediction(&model, "C", 0.6, Tag::Positive, now);
        assert!(insert_prediction_capped(db.pool(), &positive, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cap_frees_up_after_evaluation() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let first = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(30));

        let id = insert_prediction_capped(db.pool(), &first, 1).await.unwrap().unwrap();
        assert!(claim_prediction(db.pool(), id, now, TOKEN).await.unwrap());
        assert!(finalize_prediction(db.pool(), id, TOKEN, &Evaluation::expired(), now).await.unwrap());

        let again = new_prediction(&model, "C", 0.9, Tag::Alert, now);
        assert!(insert_prediction_capped(db.pool(), &again, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_cap_is_unbounded() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();

        for i in 0..5 {
            let p = new_prediction(&model, "C", 0.9, Tag::Alert, now + Duration::seconds(i));
            assert!(insert_prediction_capped(db.pool(), &p, 0).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(20));
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();

        assert!(claim_prediction(db.pool(), id, now, TOKEN).await.unwrap());
        assert!(!claim_prediction(db.pool(), id, now, TOKEN).await.unwrap());
        assert!(claim_due(db.pool(), now, 10, TOKEN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_respects_evaluation_time_and_retry() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let due = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(20));
        let not_due = new_prediction(&model, "D", 0.9, Tag::Alert, now);

        let due_id = insert_prediction_capped(db.pool(), &due, 0).await.unwrap().unwrap();
        insert_prediction_capped(db.pool(), &not_due, 0).await.unwrap();

        assert_eq!(claim_due(db.pool(), now, 10, TOKEN).await.unwrap(), vec![due_id]);

        release_claim(db.pool(), due_id, TOKEN, now + Duration::seconds(30)).await.unwrap();
        assert!(claim_due(db.pool(), now, 10, TOKEN).await.unwrap().is_empty());
        assert_eq!(
            claim_due(db.pool(), now + Duration::seconds(31), 10, TOKEN).await.unwrap(),
            vec![due_id]
        );

        let stored = get_prediction(db.pool(), due_id).await.unwrap();
        assert_eq!(stored.evaluation_attempts, 1);
    }

    #[tokio::test]
    async fn test_finalize_requires_claim() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(20));
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();

        assert!(!finalize_prediction(db.pool(), id, TOKEN, &Evaluation::expired(), now).await.unwrap());

        claim_prediction(db.pool(), id, now, TOKEN).await.unwrap();
        assert!(finalize_prediction(db.pool(), id, TOKEN, &Evaluation::expired(), now).await.unwrap());
        assert!(!finalize_prediction(db.pool(), id, TOKEN, &Evaluation::expired(), now).await.unwrap());

        let stored = get_prediction(db.pool(), id).await.unwrap();
        assert_eq!(stored.status, PredictionStatus::Inactive);
        assert_eq!(stored.evaluation_result, Some(EvaluationResult::Expired));
    }

    #[tokio::test]
    async fn test_stale_claims_are_released() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(20));
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();

        claim_prediction(db.pool(), id, now - Duration::minutes(10), TOKEN).await.unwrap();
        assert_eq!(release_stale_claims(db.pool(), now - Duration::minutes(5)).await.unwrap(), 1);
        assert_eq!(get_prediction(db.pool(), id).await.unwrap().status, PredictionStatus::Active);
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_finalize_after_takeover() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(20));
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();

        // the first sweep stalls long enough for its claim to be reclaimed
        let slow = 1;
        let fast = 2;
        assert!(claim_prediction(db.pool(), id, now - Duration::minutes(10), slow).await.unwrap());
        assert_eq!(release_stale_claims(db.pool(), now - Duration::minutes(5)).await.unwrap(), 1);
        assert_eq!(claim_due(db.pool(), now, 10, fast).await.unwrap(), vec![id]);

        assert!(!renew_claim(db.pool(), id, slow, now).await.unwrap());
        assert!(!finalize_prediction(db.pool(), id, slow, &Evaluation::expired(), now).await.unwrap());
        release_claim(db.pool(), id, slow, now + Duration::minutes(1)).await.unwrap();
        assert_eq!(get_prediction(db.pool(), id).await.unwrap().evaluation_attempts, 0);

        assert!(renew_claim(db.pool(), id, fast, now).await.unwrap());
        let success = Evaluation {
            result: EvaluationResult::Success,
            actual_price_change_pct: Some(5.5),
            ..Evaluation::expired()
        };
        assert!(finalize_prediction(db.pool(), id, fast, &success, now).await.unwrap());

        let stored = get_prediction(db.pool(), id).await.unwrap();
        assert_eq!(stored.status, PredictionStatus::Inactive);
        assert_eq!(stored.evaluation_result, Some(EvaluationResult::Success));
    }

    #[tokio::test]
    async fn test_renewed_claim_is_not_stale() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(20));
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();

        claim_prediction(db.pool(), id, now - Duration::minutes(10), TOKEN).await.unwrap();
        assert!(renew_claim(db.pool(), id, TOKEN, now).await.unwrap());
        assert_eq!(release_stale_claims(db.pool(), now - Duration::minutes(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_tick_is_recorded_once_per_model() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let from_tick = |secs| NewPrediction {
            tick_id: Some(77),
            ..new_prediction(&model, "C", 0.3, Tag::Negative, now + Duration::seconds(secs))
        };

        assert!(insert_prediction_capped(db.pool(), &from_tick(0), 0).await.unwrap().is_some());
        assert!(insert_prediction_capped(db.pool(), &from_tick(1), 0).await.unwrap().is_none());

        // entries without a tick are never treated as duplicates
        for i in 0..2 {
            let manual = new_prediction(&model, "C", 0.3, Tag::Negative, now + Duration::seconds(i));
            assert!(insert_prediction_capped(db.pool(), &manual, 0).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_unknown_status_is_integrity_error() {
        let (db, model) = seeded_db().await;
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, Utc::now());
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();

        sqlx::query("UPDATE predictions SET status = 'wait' WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();

        assert!(matches!(
            get_prediction(db.pool(), id).await,
            Err(Error::IntegrityError(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_prediction_timestamp_is_integrity_error() {
        let (db, model) = seeded_db().await;
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, Utc::now());
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();

        sqlx::query("UPDATE predictions SET prediction_timestamp = NULL WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();

        assert!(matches!(
            get_prediction(db.pool(), id).await,
            Err(Error::IntegrityError(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        for (coin, p, tag) in [("A", 0.9, Tag::Alert), ("A", 0.6, Tag::Positive), ("B", 0.2, Tag::Negative)] {
            let np = new_prediction(&model, coin, p, tag, now);
            insert_prediction_capped(db.pool(), &np, 0).await.unwrap();
        }

        let alerts = list_predictions(
            db.pool(),
            &PredictionQuery {
                active_model_id: Some(model.id),
                tag: Some(Tag::Alert),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(alerts.len(), 1);

        let coin_a = list_predictions(
            db.pool(),
            &PredictionQuery {
                coin_id: Some("A".to_string()),
                status: Some(PredictionStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(coin_a.len(), 2);

        let inactive = list_predictions(
            db.pool(),
            &PredictionQuery {
                status: Some(PredictionStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(inactive.is_empty());

        let paged = list_predictions(
            db.pool(),
            &PredictionQuery {
                limit: 2,
                offset: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn test_outcome_buckets_and_delete() {
        let (db, model) = seeded_db().await;
        let now = Utc::now();
        let p = new_prediction(&model, "C", 0.9, Tag::Alert, now - Duration::minutes(20));
        let id = insert_prediction_capped(db.pool(), &p, 0).await.unwrap().unwrap();
        claim_prediction(db.pool(), id, now, TOKEN).await.unwrap();
        let evaluation = Evaluation {
            result: EvaluationResult::Success,
            actual_price_change_pct: Some(6.0),
            ath_highest_pct: Some(7.5),
            ath_lowest_pct: Some(-1.0),
            ath_timestamp: Some(now - Duration::minutes(12)),
        };
        finalize_prediction(db.pool(), id, TOKEN, &evaluation, now).await.unwrap();
        let pending = new_prediction(&model, "D", 0.3, Tag::Negative, now);
        insert_prediction_capped(db.pool(), &pending, 0).await.unwrap();

        let buckets = get_outcome_buckets(db.pool(), model.id).await.unwrap();
        assert_eq!(buckets.len(), 2);
        let success = buckets
            .iter()
            .find(|b| b.result == Some(EvaluationResult::Success))
            .unwrap();
        assert_eq!(success.count, 1);
        assert!((success.sum_change_pct - 6.0).abs() < 1e-9);

        assert_eq!(delete_predictions_for_model(db.pool(), model.id).await.unwrap(), 2);
        assert!(get_outcome_buckets(db.pool(), model.id).await.unwrap().is_empty());
    }
}
