//! Per-model statistics, computed from the prediction log on request

use coinalert_core::{
    EvaluationResult, OutcomeBucket, PredictionStatus, PredictionStore, Result,
    StatisticsSnapshot, Tag,
};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    total: u64,
    success: u64,
    failed: u64,
    expired: u64,
    pending: u64,
    sum_success_pct: f64,
    sum_failed_pct: f64,
}

impl Counters {
    fn add(&mut self, bucket: &OutcomeBucket) {
        self.total += bucket.count;
        match (bucket.status, bucket.result) {
            (PredictionStatus::Inactive, Some(EvaluationResult::Success)) => {
                self.success += bucket.count;
                self.sum_success_pct += bucket.sum_change_pct;
            }
            (PredictionStatus::Inactive, Some(EvaluationResult::Failed)) => {
                self.failed += bucket.count;
                self.sum_failed_pct += bucket.sum_change_pct;
            }
            (PredictionStatus::Inactive, Some(EvaluationResult::Expired)) => {
                self.expired += bucket.count
            }
            _ => self.pending += bucket.count,
        }
    }

    /// success / (success + failed), 0 when nothing was decided
    fn success_rate(&self) -> f64 {
        let decided = self.success + self.failed;
        if decided == 0 {
            0.0
        } else {
            self.success as f64 / decided as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ModelCounters {
    alerts: Counters,
    non_alerts: Counters,
}

impl ModelCounters {
    fn from_buckets(buckets: &[OutcomeBucket]) -> Self {
        let mut counters = Self::default();
        for bucket in buckets {
            if bucket.tag == Tag::Alert {
                counters.alerts.add(bucket);
            } else {
                counters.non_alerts.add(bucket);
            }
        }
        counters
    }

    fn snapshot(&self, model_id: i64) -> StatisticsSnapshot {
        let profit = self.alerts.sum_success_pct;
        let loss = self.alerts.sum_failed_pct;

        StatisticsSnapshot {
            model_id,
            total_predictions: self.alerts.total + self.non_alerts.total,
            alerts_total: self.alerts.total,
            alerts_success: self.alerts.success,
            alerts_failed: self.alerts.failed,
            alerts_expired: self.alerts.expired,
            alerts_pending: self.alerts.pending,
            alerts_success_rate: self.alerts.success_rate(),
            non_alerts_total: self.non_alerts.total,
            non_alerts_success: self.non_alerts.success,
            non_alerts_failed: self.non_alerts.failed,
            non_alerts_expired: self.non_alerts.expired,
            non_alerts_pending: self.non_alerts.pending,
            non_alerts_success_rate: self.non_alerts.success_rate(),
            total_performance_pct: profit + loss,
            alerts_profit_pct: profit,
            alerts_loss_pct: loss,
        }
    }
}

/// Statistics over a model's prediction log.
///
/// Every snapshot is one grouped scan of the log, so it can never drift
/// from what is stored, and deleting a model's logs resets it.
pub struct StatisticsAggregator {
    store: Arc<dyn PredictionStore>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn PredictionStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self, model_id: i64) -> Result<StatisticsSnapshot> {
        let buckets = self.store.outcome_buckets(model_id).await?;
        debug!("Statistics for model {} from {} buckets", model_id, buckets.len());
        Ok(ModelCounters::from_buckets(&buckets).snapshot(model_id))
    }
}
