//! Prediction log entries and their lifecycle enums

use crate::{Error, Model, Result, TargetDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Probability boundary between `negative` and `positive`
pub const POSITIVE_BOUNDARY: f64 = 0.5;

/// Classification of a prediction's probability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Negative,
    Positive,
    Alert,
}

impl Tag {
    /// Alert wins over the 50% boundary, even when the threshold sits below it.
    pub fn classify(probability: f64, alert_threshold: f64) -> Tag {
        if probability >= alert_threshold {
            Tag::Alert
        } else if probability >= POSITIVE_BOUNDARY {
            Tag::Positive
        } else {
            Tag::Negative
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Negative => "negative",
            Tag::Positive => "positive",
            Tag::Alert => "alert",
        }
    }

    pub fn is_alert(&self) -> bool {
        matches!(self, Tag::Alert)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "negative" => Ok(Tag::Negative),
            "positive" => Ok(Tag::Positive),
            "alert" => Ok(Tag::Alert),
            other => Err(Error::InvalidData(format!("unknown tag '{}'", other))),
        }
    }
}

/// Lifecycle state of a prediction.
///
/// `Active` means evaluation is pending; `Evaluating` is held by exactly one
/// scheduler worker; `Inactive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Active,
    Evaluating,
    Inactive,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Active => "active",
            PredictionStatus::Evaluating => "evaluating",
            PredictionStatus::Inactive => "inactive",
        }
    }

    /// Value shown by the dashboards (`aktiv` / `inaktiv`)
    pub fn external(&self) -> &'static str {
        match self {
            PredictionStatus::Active | PredictionStatus::Evaluating => "aktiv",
            PredictionStatus::Inactive => "inaktiv",
        }
    }

    /// Parse a status filter coming from the API, accepting both the
    /// dashboard names and the internal ones
    pub fn from_external(s: &str) -> Result<Self> {
        match s {
            "aktiv" => Ok(PredictionStatus::Active),
            "inaktiv" => Ok(PredictionStatus::Inactive),
            other => other.parse(),
        }
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(PredictionStatus::Active),
            "evaluating" => Ok(PredictionStatus::Evaluating),
            "inactive" => Ok(PredictionStatus::Inactive),
            other => Err(Error::InvalidData(format!("unknown status '{}'", other))),
        }
    }
}

/// Terminal outcome of an evaluated prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationResult {
    Success,
    Failed,
    /// Price data was unavailable; neither success nor failure
    Expired,
}

impl EvaluationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationResult::Success => "success",
            EvaluationResult::Failed => "failed",
            EvaluationResult::Expired => "expired",
        }
    }
}

impl fmt::Display for EvaluationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(EvaluationResult::Success),
            "failed" => Ok(EvaluationResult::Failed),
            "expired" => Ok(EvaluationResult::Expired),
            other => Err(Error::InvalidData(format!("unknown evaluation result '{}'", other))),
        }
    }
}

/// A classified tick about to be written to the prediction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrediction {
    pub model_id: i64,
    pub coin_id: String,
    pub probability: f64,
    pub tag: Tag,
    pub prediction_timestamp: DateTime<Utc>,
    pub evaluation_timestamp: DateTime<Utc>,
    pub target_direction: TargetDirection,
    pub price_change_percent: f64,
    pub price_at_prediction: Option<f64>,
    /// Source tick, when the prediction came through the ingestion pipeline
    pub tick_id: Option<i64>,
}

impl NewPrediction {
    /// Build the log entry for `model`, snapshotting its evaluation target
    pub fn for_model(
        model: &Model,
        coin_id: &str,
        probability: f64,
        tag: Tag,
        prediction_timestamp: DateTime<Utc>,
        price_at_prediction: Option<f64>,
        tick_id: Option<i64>,
    ) -> Self {
        Self {
            model_id: model.id,
            coin_id: coin_id.to_string(),
            probability,
            tag,
            prediction_timestamp,
            evaluation_timestamp: model.evaluation_timestamp(prediction_timestamp),
            target_direction: model.target_direction,
            price_change_percent: model.price_change_percent,
            price_at_prediction,
            tick_id,
        }
    }

    /// The stored form of this entry right after it was inserted as `id`
    pub fn into_prediction(self, id: i64) -> Prediction {
        Prediction {
            id,
            model_id: self.model_id,
            coin_id: self.coin_id,
            probability: self.probability,
            tag: self.tag,
            status: PredictionStatus::Active,
            prediction_timestamp: self.prediction_timestamp,
            evaluation_timestamp: self.evaluation_timestamp,
            target_direction: self.target_direction,
            price_change_percent: self.price_change_percent,
            price_at_prediction: self.price_at_prediction,
            tick_id: self.tick_id,
            evaluation_result: None,
            actual_price_change_pct: None,
            ath_highest_pct: None,
            ath_lowest_pct: None,
            ath_timestamp: None,
            evaluated_at: None,
            evaluation_attempts: 0,
        }
    }
}

/// A stored prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub model_id: i64,
    pub coin_id: String,
    pub probability: f64,
    pub tag: Tag,
    pub status: PredictionStatus,
    pub prediction_timestamp: DateTime<Utc>,
    pub evaluation_timestamp: DateTime<Utc>,
    pub target_direction: TargetDirection,
    pub price_change_percent: f64,
    pub price_at_prediction: Option<f64>,
    pub tick_id: Option<i64>,
    pub evaluation_result: Option<EvaluationResult>,
    pub actual_price_change_pct: Option<f64>,
    pub ath_highest_pct: Option<f64>,
    pub ath_lowest_pct: Option<f64>,
    pub ath_timestamp: Option<DateTime<Utc>>,
    pub evaluated_at: Option<DateTime<Utc>>,
    /// Number of evaluation attempts that hit a transient failure
    pub evaluation_attempts: u32,
}

impl Prediction {
    pub fn is_evaluated(&self) -> bool {
        self.status == PredictionStatus::Inactive
    }

    /// `evaluation_result` is set iff the prediction is inactive
    pub fn check_integrity(&self) -> Result<()> {
        if self.is_evaluated() != self.evaluation_result.is_some() {
            return Err(Error::IntegrityError(format!(
                "prediction {} has status {} but result {:?}",
                self.id, self.status, self.evaluation_result
            )));
        }
        if self.evaluation_timestamp < self.prediction_timestamp {
            return Err(Error::IntegrityError(format!(
                "prediction {} is evaluated before it was made",
                self.id
            )));
        }
        Ok(())
    }
}

/// Outcome written by the evaluation scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub result: EvaluationResult,
    pub actual_price_change_pct: Option<f64>,
    pub ath_highest_pct: Option<f64>,
    pub ath_lowest_pct: Option<f64>,
    pub ath_timestamp: Option<DateTime<Utc>>,
}

impl Evaluation {
    /// Non-committal terminal outcome with no measurements
    pub fn expired() -> Self {
        Self {
            result: EvaluationResult::Expired,
            actual_price_change_pct: None,
            ath_highest_pct: None,
            ath_lowest_pct: None,
            ath_timestamp: None,
        }
    }
}

/// Default page size for prediction listings
pub const DEFAULT_PREDICTION_LIMIT: u32 = 100;
/// Hard cap on prediction page size
pub const MAX_PREDICTION_LIMIT: u32 = 1000;

/// Filters for listing predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionQuery {
    pub active_model_id: Option<i64>,
    pub tag: Option<Tag>,
    /// `Active` also matches predictions currently being evaluated
    pub status: Option<PredictionStatus>,
    pub coin_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for PredictionQuery {
    fn default() -> Self {
        Self {
            active_model_id: None,
            tag: None,
            status: None,
            coin_id: None,
            limit: DEFAULT_PREDICTION_LIMIT,
            offset: 0,
        }
    }
}

impl PredictionQuery {
    /// Build a query from raw API parameters
    pub fn from_params(
        active_model_id: Option<i64>,
        tag: Option<&str>,
        status: Option<&str>,
        coin_id: Option<&str>,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Self> {
        Ok(Self {
            active_model_id,
            tag: tag.map(|t| t.parse::<Tag>()).transpose()?,
            status: status.map(PredictionStatus::from_external).transpose()?,
            coin_id: coin_id.map(str::to_string),
            limit: limit
                .unwrap_or(DEFAULT_PREDICTION_LIMIT)
                .clamp(1, MAX_PREDICTION_LIMIT),
            offset: offset.unwrap_or(0),
        })
    }
}
