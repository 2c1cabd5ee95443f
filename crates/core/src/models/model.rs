//! Model configuration as seen by the engine

use crate::{Error, Result, Tag};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Longest ignore window accepted (one year)
pub const MAX_IGNORE_SECONDS: u64 = 365 * 24 * 3600;

/// Which coins a model looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoinFilterMode {
    #[default]
    All,
    Whitelist,
}

impl CoinFilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinFilterMode::All => "all",
            CoinFilterMode::Whitelist => "whitelist",
        }
    }
}

impl FromStr for CoinFilterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(CoinFilterMode::All),
            "whitelist" => Ok(CoinFilterMode::Whitelist),
            other => Err(Error::InvalidData(format!("unknown coin filter mode '{}'", other))),
        }
    }
}

/// Direction the price has to move for a prediction to succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetDirection {
    #[default]
    Up,
    Down,
}

impl TargetDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetDirection::Up => "up",
            TargetDirection::Down => "down",
        }
    }

    /// Whether `change_pct` satisfies a move of `target_pct` in this direction
    pub fn is_met(&self, change_pct: f64, target_pct: f64) -> bool {
        match self {
            TargetDirection::Up => change_pct >= target_pct,
            TargetDirection::Down => change_pct <= -target_pct,
        }
    }
}

impl fmt::Display for TargetDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(TargetDirection::Up),
            "down" => Ok(TargetDirection::Down),
            other => Err(Error::InvalidData(format!("unknown target direction '{}'", other))),
        }
    }
}

/// A prediction model's runtime configuration.
///
/// Owned by the configuration store; the engine only reads snapshots of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    /// Probability at or above which a tick becomes an alert, in (0, 1]
    pub alert_threshold: f64,
    #[serde(default)]
    pub coin_filter_mode: CoinFilterMode,
    #[serde(default)]
    pub coin_whitelist: Option<BTreeSet<String>>,
    /// Coin phases the model accepts (None = every phase)
    #[serde(default)]
    pub phases: Option<BTreeSet<u8>>,
    /// Ignore window after a `negative` tick, in seconds (0 = never ignore)
    #[serde(default)]
    pub ignore_bad_seconds: u64,
    #[serde(default)]
    pub ignore_positive_seconds: u64,
    #[serde(default)]
    pub ignore_alert_seconds: u64,
    /// Max active log entries per coin and category (0 = unbounded)
    #[serde(default)]
    pub max_log_entries_per_coin_negative: u32,
    #[serde(default)]
    pub max_log_entries_per_coin_positive: u32,
    #[serde(default)]
    pub max_log_entries_per_coin_alert: u32,
    pub is_active: bool,
    /// Evaluation horizon in minutes
    pub future_minutes: u32,
    /// Target move in percent (always positive, direction is separate)
    pub price_change_percent: f64,
    #[serde(default)]
    pub target_direction: TargetDirection,
    #[serde(default)]
    pub send_alerts_to_webhook: bool,
}

impl Model {
    /// Reject malformed configuration before it can reach the engine
    pub fn validate(&self) -> Result<()> {
        if !(self.alert_threshold > 0.0 && self.alert_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "alert_threshold must be in (0, 1], got {}",
                self.alert_threshold
            )));
        }

        if self.future_minutes == 0 {
            return Err(Error::InvalidConfig("future_minutes must be positive".to_string()));
        }

        if !self.price_change_percent.is_finite() || self.price_change_percent <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "price_change_percent must be positive, got {}",
                self.price_change_percent
            )));
        }

        for secs in [
            self.ignore_bad_seconds,
            self.ignore_positive_seconds,
            self.ignore_alert_seconds,
        ] {
            if secs > MAX_IGNORE_SECONDS {
                return Err(Error::InvalidConfig(format!(
                    "ignore window of {}s exceeds the {}s maximum",
                    secs, MAX_IGNORE_SECONDS
                )));
            }
        }

        if self.coin_filter_mode == CoinFilterMode::Whitelist
            && self.coin_whitelist.as_ref().map_or(true, |w| w.is_empty())
        {
            return Err(Error::InvalidConfig(
                "whitelist mode requires a non-empty coin_whitelist".to_string(),
            ));
        }

        Ok(())
    }

    /// Tag a probability against this model's threshold
    pub fn classify(&self, probability: f64) -> Tag {
        Tag::classify(probability, self.alert_threshold)
    }

    /// Coin filter: under whitelist mode only listed coins pass
    pub fn accepts_coin(&self, coin_id: &str) -> bool {
        match self.coin_filter_mode {
            CoinFilterMode::All => true,
            CoinFilterMode::Whitelist => self
                .coin_whitelist
                .as_ref()
                .map_or(false, |w| w.contains(coin_id)),
        }
    }

    /// Phase filter: absent `phases` lets everything through, otherwise the
    /// tick needs a phase that is listed
    pub fn accepts_phase(&self, phase: Option<u8>) -> bool {
        match &self.phases {
            None => true,
            Some(phases) => phase.map_or(false, |p| phases.contains(&p)),
        }
    }

    /// Ignore window for the outcome class of `tag`
    pub fn ignore_duration(&self, tag: Tag) -> Duration {
        let secs = match tag {
            Tag::Negative => self.ignore_bad_seconds,
            Tag::Positive => self.ignore_positive_seconds,
            Tag::Alert => self.ignore_alert_seconds,
        };
        Duration::seconds(secs.min(MAX_IGNORE_SECONDS) as i64)
    }

    /// Log cap for `tag` (0 = unbounded)
    pub fn max_log_entries(&self, tag: Tag) -> u32 {
        match tag {
            Tag::Negative => self.max_log_entries_per_coin_negative,
            Tag::Positive => self.max_log_entries_per_coin_positive,
            Tag::Alert => self.max_log_entries_per_coin_alert,
        }
    }

    /// When a prediction made at `prediction_timestamp` is due
    pub fn evaluation_timestamp(&self, prediction_timestamp: DateTime<Utc>) -> DateTime<Utc> {
        prediction_timestamp + Duration::minutes(i64::from(self.future_minutes))
    }
}

/// PATCH body for the alert configuration of a model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfigUpdate {
    pub alert_threshold: Option<f64>,
    pub coin_filter_mode: Option<CoinFilterMode>,
    /// `Some(None)` clears the whitelist
    #[serde(default, with = "double_option")]
    pub coin_whitelist: Option<Option<BTreeSet<String>>>,
    #[serde(default, with = "double_option")]
    pub phases: Option<Option<BTreeSet<u8>>>,
    pub send_alerts_to_webhook: Option<bool>,
}

/// PATCH body for the ignore windows of a model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IgnoreSettingsUpdate {
    pub ignore_bad_seconds: Option<u64>,
    pub ignore_positive_seconds: Option<u64>,
    pub ignore_alert_seconds: Option<u64>,
}

/// PATCH body for the per-coin log caps of a model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaxLogEntriesUpdate {
    pub max_log_entries_per_coin_negative: Option<u32>,
    pub max_log_entries_per_coin_positive: Option<u32>,
    pub max_log_entries_per_coin_alert: Option<u32>,
}

impl Model {
    pub fn apply_alert_config(&mut self, update: AlertConfigUpdate) {
        if let Some(threshold) = update.alert_threshold {
            self.alert_threshold = threshold;
        }
        if let Some(mode) = update.coin_filter_mode {
            self.coin_filter_mode = mode;
        }
        if let Some(whitelist) = update.coin_whitelist {
            self.coin_whitelist = whitelist;
        }
        if let Some(phases) = update.phases {
            self.phases = phases;
        }
        if let Some(send) = update.send_alerts_to_webhook {
            self.send_alerts_to_webhook = send;
        }
    }

    pub fn apply_ignore_settings(&mut self, update: IgnoreSettingsUpdate) {
        if let Some(secs) = update.ignore_bad_seconds {
            self.ignore_bad_seconds = secs;
        }
        if let Some(secs) = update.ignore_positive_seconds {
            self.ignore_positive_seconds = secs;
        }
        if let Some(secs) = update.ignore_alert_seconds {
            self.ignore_alert_seconds = secs;
        }
    }

    pub fn apply_max_log_entries(&mut self, update: MaxLogEntriesUpdate) {
        if let Some(cap) = update.max_log_entries_per_coin_negative {
            self.max_log_entries_per_coin_negative = cap;
        }
        if let Some(cap) = update.max_log_entries_per_coin_positive {
            self.max_log_entries_per_coin_positive = cap;
        }
        if let Some(cap) = update.max_log_entries_per_coin_alert {
            self.max_log_entries_per_coin_alert = cap;
        }
    }
}

/// Distinguishes an absent field from an explicit `null` in PATCH bodies
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
pub(crate) fn sample_model() -> Model {
    Model {
        id: 1,
        name: "pump-detector".to_string(),
        alert_threshold: 0.7,
        coin_filter_mode: CoinFilterMode::All,
        coin_whitelist: None,
        phases: None,
        ignore_bad_seconds: 0,
        ignore_positive_seconds: 0,
        ignore_alert_seconds: 20,
        max_log_entries_per_coin_negative: 0,
        max_log_entries_per_coin_positive: 0,
        max_log_entries_per_coin_alert: 0,
        is_active: true,
        future_minutes: 10,
        price_change_percent: 5.0,
        target_direction: TargetDirection::Up,
        send_alerts_to_webhook: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_threshold_bounds() {
        let mut model = sample_model();
        assert!(model.validate().is_ok());

        model.alert_threshold = 1.0;
        assert!(model.validate().is_ok());

        model.alert_threshold = 0.0;
        assert!(matches!(model.validate(), Err(Error::InvalidConfig(_))));

        model.alert_threshold = 1.2;
        assert!(matches!(model.validate(), Err(Error::InvalidConfig(_))));

        model.alert_threshold = f64::NAN;
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_whitelist_mode_requires_coins() {
        let mut model = sample_model();
        model.coin_filter_mode = CoinFilterMode::Whitelist;
        assert!(model.validate().is_err());

        model.coin_whitelist = Some(["BTC".to_string()].into_iter().collect());
        assert!(model.validate().is_ok());
        assert!(model.accepts_coin("BTC"));
        assert!(!model.accepts_coin("ETH"));
    }

    #[test]
    fn test_phase_filter() {
        let mut model = sample_model();
        assert!(model.accepts_phase(None));
        assert!(model.accepts_phase(Some(3)));

        model.phases = Some([1, 2].into_iter().collect());
        assert!(model.accepts_phase(Some(2)));
        assert!(!model.accepts_phase(Some(3)));
        assert!(!model.accepts_phase(None));
    }

    #[test]
    fn test_ignore_duration_by_tag() {
        let model = sample_model();
        assert_eq!(model.ignore_duration(Tag::Alert), Duration::seconds(20));
        assert_eq!(model.ignore_duration(Tag::Negative), Duration::zero());
    }

    #[test]
    fn test_target_direction() {
        assert!(TargetDirection::Up.is_met(6.0, 5.0));
        assert!(TargetDirection::Up.is_met(5.0, 5.0));
        assert!(!TargetDirection::Up.is_met(4.9, 5.0));
        assert!(TargetDirection::Down.is_met(-5.5, 5.0));
        assert!(!TargetDirection::Down.is_met(5.5, 5.0));
    }

    #[test]
    fn test_patch_null_clears_whitelist() {
        let mut model = sample_model();
        model.coin_whitelist = Some(["BTC".to_string()].into_iter().collect());

        let update: AlertConfigUpdate =
            serde_json::from_str(r#"{"coin_whitelist": null, "alert_threshold": 0.8}"#).unwrap();
        model.apply_alert_config(update);
        assert_eq!(model.coin_whitelist, None);
        assert_eq!(model.alert_threshold, 0.8);

        let untouched: AlertConfigUpdate = serde_json::from_str(r#"{}"#).unwrap();
        assert!(untouched.coin_whitelist.is_none());
    }
}
