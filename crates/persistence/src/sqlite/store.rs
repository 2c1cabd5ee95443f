//! Storage traits implemented on top of the SQLite pool

use super::{coin_metrics, models, predictions, Database};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coinalert_core::{
    Evaluation, Model, ModelStore, NewPrediction, OutcomeBucket, Prediction, PredictionQuery,
    PredictionStore, PricePoint, PriceSource, Result, TickPage, TickPoller,
};

#[async_trait]
impl ModelStore for Database {
    async fn list_models(&self) -> Result<Vec<Model>> {
        models::list_models(self.pool(), false).await
    }

    async fn list_active_models(&self) -> Result<Vec<Model>> {
        models::list_models(self.pool(), true).await
    }

    async fn get_model(&self, model_id: i64) -> Result<Option<Model>> {
        models::get_model(self.pool(), model_id).await
    }

    async fn insert_model(&self, model: &Model) -> Result<i64> {
        models::create_model(self.pool(), model).await
    }

    async fn update_model(&self, model: &Model) -> Result<()> {
        models::update_model(self.pool(), model).await
    }
}

#[async_trait]
impl PredictionStore for Database {
    async fn insert_prediction_capped(&self, prediction: &NewPrediction, cap: u32) -> Result<Option<i64>> {
        predictions::insert_prediction_capped(self.pool(), prediction, cap).await
    }

    async fn get_prediction(&self, prediction_id: i64) -> Result<Prediction> {
        predictions::get_prediction(self.pool(), prediction_id).await
    }

    async fn list_predictions(&self, query: &PredictionQuery) -> Result<Vec<Prediction>> {
        predictions::list_predictions(self.pool(), query).await
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u32, token: i64) -> Result<Vec<i64>> {
        predictions::claim_due(self.pool(), now, limit, token).await
    }

    async fn claim_prediction(&self, prediction_id: i64, now: DateTime<Utc>, token: i64) -> Result<bool> {
        predictions::claim_prediction(self.pool(), prediction_id, now, token).await
    }

    async fn renew_claim(&self, prediction_id: i64, token: i64, now: DateTime<Utc>) -> Result<bool> {
        predictions::renew_claim(self.pool(), prediction_id, token, now).await
    }

    async fn release_claim(&self, prediction_id: i64, token: i64, retry_at: DateTime<Utc>) -> Result<()> {
        predictions::release_claim(self.pool(), prediction_id, token, retry_at).await
    }

    async fn finalize(
        &self,
        prediction_id: i64,
        token: i64,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        predictions::finalize_prediction(self.pool(), prediction_id, token, evaluation, now).await
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        predictions::release_stale_claims(self.pool(), claimed_before).await
    }

    async fn delete_for_model(&self, model_id: i64) -> Result<u64> {
        predictions::delete_predictions_for_model(self.pool(), model_id).await
    }

    async fn outcome_buckets(&self, model_id: i64) -> Result<Vec<OutcomeBucket>> {
        predictions::get_outcome_buckets(self.pool(), model_id).await
    }
}

#[async_trait]
impl PriceSource for Database {
    async fn price_series(
        &self,
        coin_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>> {
        coin_metrics::get_price_series(self.pool(), coin_id, from, to).await
    }
}

#[async_trait]
impl TickPoller for Database {
    async fn poll_ticks(&self, after_id: i64, limit: u32) -> Result<TickPage> {
        coin_metrics::get_coin_metrics_after(self.pool(), after_id, limit).await
    }
}
