//! Per-model statistics consumed by the dashboards

use crate::{EvaluationResult, PredictionStatus, Tag};
use serde::{Deserialize, Serialize};

/// Aggregated view of a model's prediction log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub model_id: i64,
    pub total_predictions: u64,

    pub alerts_total: u64,
    pub alerts_success: u64,
    pub alerts_failed: u64,
    pub alerts_expired: u64,
    pub alerts_pending: u64,
    /// `success / (success + failed)` over alerts, in `[0, 1]` (0 when none are decided)
    pub alerts_success_rate: f64,

    pub non_alerts_total: u64,
    pub non_alerts_success: u64,
    pub non_alerts_failed: u64,
    pub non_alerts_expired: u64,
    pub non_alerts_pending: u64,
    pub non_alerts_success_rate: f64,

    pub total_performance_pct: f64,
    pub alerts_profit_pct: f64,
    pub alerts_loss_pct: f64,
}

/// One group of a live scan over a model's predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeBucket {
    pub tag: Tag,
    pub status: PredictionStatus,
    pub result: Option<EvaluationResult>,
    pub count: u64,
    /// Sum of `actual_price_change_pct` over the group
    pub sum_change_pct: f64,
}
