//! Typed facade over the engine, one method per dashboard API operation

use crate::pipeline::{Classifier, Decision, Observation};
use crate::registry::ModelRegistry;
use crate::statistics::StatisticsAggregator;
use chrono::{DateTime, Utc};
use coinalert_core::{
    AlertConfigUpdate, Error, IgnoreCache, IgnoreSettingsUpdate, MaxLogEntriesUpdate, Model,
    ModelStore, Prediction, PredictionQuery, PredictionStore, Probability, Result,
    StatisticsSnapshot, Tag,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Manual single-coin classification request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub model_id: i64,
    pub coin_id: String,
    pub probability: f64,
    #[serde(default)]
    pub phase: Option<u8>,
    #[serde(default)]
    pub price: Option<f64>,
    /// Defaults to now
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PredictOutcome {
    Persisted { prediction: Prediction },
    /// Classified, but the per-coin log cap for the tag is full
    CapReached { tag: Tag },
    /// Inactive model, or coin / phase filter
    Filtered,
    /// The coin is inside an ignore window for this model
    Ignored,
}

/// Result of `reset_logs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    pub model_id: i64,
    pub deleted_predictions: u64,
}

#[derive(Clone)]
pub struct AlertService {
    models: Arc<dyn ModelStore>,
    predictions: Arc<dyn PredictionStore>,
    ignore_cache: Arc<dyn IgnoreCache>,
    registry: Arc<ModelRegistry>,
    classifier: Arc<Classifier>,
    statistics: Arc<StatisticsAggregator>,
}

impl AlertService {
    pub fn new(
        models: Arc<dyn ModelStore>,
        predictions: Arc<dyn PredictionStore>,
        ignore_cache: Arc<dyn IgnoreCache>,
        registry: Arc<ModelRegistry>,
        classifier: Arc<Classifier>,
        statistics: Arc<StatisticsAggregator>,
    ) -> Self {
        Self {
            models,
            predictions,
            ignore_cache,
            registry,
            classifier,
            statistics,
        }
    }

    pub async fn get_model(&self, model_id: i64) -> Result<Model> {
        self.models
            .get_model(model_id)
            .await?
            .ok_or(Error::ModelNotFound(model_id))
    }

    pub async fn list_models(&self) -> Result<Vec<Model>> {
        self.models.list_models().await
    }

    /// Validate and store a new model; its id is assigned by the store
    pub async fn create_model(&self, mut model: Model) -> Result<Model> {
        model.validate()?;
        model.id = self.models.insert_model(&model).await?;
        info!("Created model {} ({})", model.id, model.name);
        self.refresh_registry().await;
        Ok(model)
    }

    pub async fn update_alert_config(&self, model_id: i64, update: AlertConfigUpdate) -> Result<Model> {
        let mut model = self.get_model(model_id).await?;
        model.apply_alert_config(update);
        self.save(model).await
    }

    /// New windows apply immediately: the model's current entries are dropped
    pub async fn update_ignore_settings(&self, model_id: i64, update: IgnoreSettingsUpdate) -> Result<Model> {
        let mut model = self.get_model(model_id).await?;
        model.apply_ignore_settings(update);
        let model = self.save(model).await?;
        self.ignore_cache.clear_model(model_id);
        Ok(model)
    }

    pub async fn update_max_log_entries(&self, model_id: i64, update: MaxLogEntriesUpdate) -> Result<Model> {
        let mut model = self.get_model(model_id).await?;
        model.apply_max_log_entries(update);
        self.save(model).await
    }

    pub async fn list_predictions(&self, query: &PredictionQuery) -> Result<Vec<Prediction>> {
        self.predictions.list_predictions(query).await
    }

    pub async fn statistics(&self, model_id: i64) -> Result<StatisticsSnapshot> {
        self.get_model(model_id).await?;
        self.statistics.snapshot(model_id).await
    }

    /// Delete a model's predictions and start its statistics and ignore
    /// windows over. The model itself is kept.
    pub async fn reset_logs(&self, model_id: i64) -> Result<ResetReport> {
        self.get_model(model_id).await?;
        let deleted = self.predictions.delete_for_model(model_id).await?;
        self.ignore_cache.clear_model(model_id);
        info!("Reset logs of model {}: {} predictions deleted", model_id, deleted);

        Ok(ResetReport {
            model_id,
            deleted_predictions: deleted,
        })
    }

    /// Classify one coin outside the batch pipeline, with the same filters,
    /// ignore windows and log caps, and persist the result directly
    pub async fn predict(&self, request: PredictRequest) -> Result<PredictOutcome> {
        let model = self.get_model(request.model_id).await?;
        let probability = Probability::new(request.probability).ok_or_else(|| {
            Error::InvalidData(format!("probability {} is outside [0, 1]", request.probability))
        })?;

        let obs = Observation {
            coin_id: &request.coin_id,
            phase: request.phase,
            price: request.price,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
            tick_id: None,
        };

        match self.classifier.admit(&model, &obs) {
            Some(Decision::Ignored) => return Ok(PredictOutcome::Ignored),
            Some(_) => return Ok(PredictOutcome::Filtered),
            None => {}
        }

        let candidate = self.classifier.classify(&model, &obs, probability);
        let tag = candidate.tag;
        let cap = model.max_log_entries(tag);

        match self.predictions.insert_prediction_capped(&candidate, cap).await? {
            Some(id) => Ok(PredictOutcome::Persisted {
                prediction: candidate.into_prediction(id),
            }),
            None => Ok(PredictOutcome::CapReached { tag }),
        }
    }

    async fn save(&self, model: Model) -> Result<Model> {
        model.validate()?;
        self.models.update_model(&model).await?;
        info!("Updated configuration of model {}", model.id);
        self.refresh_registry().await;
        Ok(model)
    }

    async fn refresh_registry(&self) {
        if let Err(e) = self.registry.refresh().await {
            warn!("Model registry refresh after config change failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::PrecomputedScorer;
    use crate::test_support::{sample_model, t0};
    use coinalert_core::{CoinFilterMode, PredictionStatus};
    use coinalert_persistence::{CoinIgnoreCache, Database};

    async fn service() -> (AlertService, Arc<CoinIgnoreCache>) {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        let cache = Arc::new(CoinIgnoreCache::new());
        let registry = Arc::new(ModelRegistry::new(db.clone()));
        let classifier = Arc::new(Classifier::new(Arc::new(PrecomputedScorer), cache.clone()));
        let statistics = Arc::new(StatisticsAggregator::new(db.clone()));
        let service = AlertService::new(db.clone(), db, cache.clone(), registry, classifier, statistics);
        (service, cache)
    }

    fn request(model_id: i64, coin: &str, probability: f64, secs: i64) -> PredictRequest {
        PredictRequest {
            model_id,
            coin_id: coin.to_string(),
            probability,
            phase: None,
            price: Some(100.0),
            timestamp: Some(t0() + chrono::Duration::seconds(secs)),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_model() {
        let (service, _) = service().await;
        let mut model = sample_model(0);
        model.alert_threshold = 1.5;

        assert!(matches!(
            service.create_model(model).await,
            Err(Error::InvalidConfig(_))
        ));
        assert!(service.list_models().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_alert_config_validates() {
        let (service, _) = service().await;
        let model = service.create_model(sample_model(0)).await.unwrap();

        let bad = AlertConfigUpdate {
            coin_filter_mode: Some(CoinFilterMode::Whitelist),
            ..Default::default()
        };
        assert!(matches!(
            service.update_alert_config(model.id, bad).await,
            Err(Error::InvalidConfig(_))
        ));

        let good = AlertConfigUpdate {
            alert_threshold: Some(0.8),
            ..Default::default()
        };
        let updated = service.update_alert_config(model.id, good).await.unwrap();
        assert_eq!(updated.alert_threshold, 0.8);
        assert_eq!(service.get_model(model.id).await.unwrap().alert_threshold, 0.8);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let (service, _) = service().await;
        assert!(matches!(service.get_model(42).await, Err(Error::ModelNotFound(42))));
        assert!(matches!(service.statistics(42).await, Err(Error::ModelNotFound(42))));
    }

    #[tokio::test]
    async fn test_predict_respects_ignore_and_cap() {
        let (service, _) = service().await;
        let mut model = sample_model(0);
        model.ignore_alert_seconds = 0;
        model.max_log_entries_per_coin_alert = 1;
        let model = service.create_model(model).await.unwrap();

        let first = service.predict(request(model.id, "C", 0.9, 0)).await.unwrap();
        assert!(matches!(first, PredictOutcome::Persisted { .. }));

        let second = service.predict(request(model.id, "C", 0.95, 30)).await.unwrap();
        assert_eq!(second, PredictOutcome::CapReached { tag: Tag::Alert });

        let stats = service.statistics(model.id).await.unwrap();
        assert_eq!(stats.alerts_total, 1);
        assert_eq!(stats.alerts_pending, 1);
    }

    #[tokio::test]
    async fn test_predict_ignored_inside_window() {
        let (service, _) = service().await;
        let model = service.create_model(sample_model(0)).await.unwrap();

        service.predict(request(model.id, "C", 0.9, 0)).await.unwrap();
        assert_eq!(
            service.predict(request(model.id, "C", 0.9, 10)).await.unwrap(),
            PredictOutcome::Ignored
        );
        assert!(matches!(
            service.predict(request(model.id, "C", 0.9, 21)).await.unwrap(),
            PredictOutcome::Persisted { .. }
        ));
    }

    #[tokio::test]
    async fn test_ignore_settings_update_clears_windows() {
        let (service, cache) = service().await;
        let model = service.create_model(sample_model(0)).await.unwrap();

        service.predict(request(model.id, "C", 0.9, 0)).await.unwrap();
        assert!(!cache.should_process(model.id, "C", t0()));

        service
            .update_ignore_settings(
                model.id,
                IgnoreSettingsUpdate {
                    ignore_alert_seconds: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cache.should_process(model.id, "C", t0()));
    }

    #[tokio::test]
    async fn test_reset_keeps_model() {
        let (service, cache) = service().await;
        let model = service.create_model(sample_model(0)).await.unwrap();
        service.predict(request(model.id, "A", 0.9, 0)).await.unwrap();
        service.predict(request(model.id, "B", 0.3, 0)).await.unwrap();
        assert_eq!(service.statistics(model.id).await.unwrap().total_predictions, 2);

        let report = service.reset_logs(model.id).await.unwrap();
        assert_eq!(report.deleted_predictions, 2);
        assert!(cache.should_process(model.id, "A", t0()));

        assert_eq!(service.get_model(model.id).await.unwrap(), model);
        assert_eq!(service.statistics(model.id).await.unwrap().total_predictions, 0);
        let remaining = service
            .list_predictions(&PredictionQuery {
                active_model_id: Some(model.id),
                status: Some(PredictionStatus::Active),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_predict_rejects_bad_probability() {
        let (service, _) = service().await;
        let model = service.create_model(sample_model(0)).await.unwrap();

        assert!(matches!(
            service.predict(request(model.id, "C", 1.2, 0)).await,
            Err(Error::InvalidData(_))
        ));
    }
}
