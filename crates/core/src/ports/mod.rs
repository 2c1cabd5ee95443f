//! Seams between the engine and its collaborators (storage, price data,
//! tick feeds, suppression cache)

use crate::{
    Evaluation, Model, NewPrediction, OutcomeBucket, Prediction, PredictionQuery, PricePoint,
    Result, Tag, TickPage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Configuration store for models
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn list_models(&self) -> Result<Vec<Model>>;

    async fn list_active_models(&self) -> Result<Vec<Model>>;

    async fn get_model(&self, model_id: i64) -> Result<Option<Model>>;

    /// Insert a new model and return its id
    async fn insert_model(&self, model: &Model) -> Result<i64>;

    async fn update_model(&self, model: &Model) -> Result<()>;
}

/// Prediction log storage
#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Insert unless `cap` (when non-zero) active entries already exist for
    /// the same (model, coin, tag). Returns `None` when the cap suppressed it.
    async fn insert_prediction_capped(&self, prediction: &NewPrediction, cap: u32) -> Result<Option<i64>>;

    async fn get_prediction(&self, prediction_id: i64) -> Result<Prediction>;

    async fn list_predictions(&self, query: &PredictionQuery) -> Result<Vec<Prediction>>;

    /// Claim up to `limit` due predictions (`active -> evaluating`) under
    /// `token`. Every returned id is held exclusively by the caller.
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32, token: i64) -> Result<Vec<i64>>;

    /// Compare-and-set a single prediction from active to evaluating
    async fn claim_prediction(&self, prediction_id: i64, now: DateTime<Utc>, token: i64) -> Result<bool>;

    /// Refresh the claim time of a prediction still held under `token`.
    /// Returns false once the claim was released or taken over.
    async fn renew_claim(&self, prediction_id: i64, token: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Give a claim back after a transient failure; not due again before
    /// `retry_at`. A no-op unless the claim is still held under `token`.
    async fn release_claim(&self, prediction_id: i64, token: i64, retry_at: DateTime<Utc>) -> Result<()>;

    /// Write the terminal outcome of a claimed prediction.
    /// Returns false unless the prediction is held in `evaluating` under `token`.
    async fn finalize(
        &self,
        prediction_id: i64,
        token: i64,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Return claims older than `claimed_before` to `active`
    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64>;

    async fn delete_for_model(&self, model_id: i64) -> Result<u64>;

    async fn outcome_buckets(&self, model_id: i64) -> Result<Vec<OutcomeBucket>>;
}

/// Historical price series for a coin
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Points with `from <= timestamp <= to`, ordered by time
    async fn price_series(
        &self,
        coin_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>>;
}

/// Pull side of the tick feed
#[async_trait]
pub trait TickPoller: Send + Sync {
    /// Up to `limit` rows with `id > after_id`, ordered by id. Rows that
    /// cannot be decoded are skipped but still counted in the page.
    async fn poll_ticks(&self, after_id: i64, limit: u32) -> Result<TickPage>;
}

/// Per (model, coin) suppression windows.
///
/// Implementations must fail open: when the backing store is unavailable
/// `should_process` answers true.
pub trait IgnoreCache: Send + Sync {
    fn should_process(&self, model_id: i64, coin_id: &str, now: DateTime<Utc>) -> bool;

    /// Start or refresh the window for the outcome class of `tag`
    fn record(&self, model: &Model, coin_id: &str, tag: Tag, now: DateTime<Utc>);

    /// Drop expired entries, returning how many were removed
    fn reap(&self, now: DateTime<Utc>) -> usize;

    fn clear_model(&self, model_id: i64);
}
