//! Per (tick, model) filtering and classification

use crate::scorer::Scorer;
use chrono::{DateTime, Utc};
use coinalert_core::{IgnoreCache, Model, NewPrediction, Probability, Result, Tick};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to a tick for one model
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Model is switched off
    Inactive,
    /// Coin or phase filter rejected the tick
    Filtered,
    /// The pair is inside an ignore window
    Ignored,
    /// The scorer had no probability for this model
    Unscored,
    /// Classified; the ignore entry is already recorded
    Candidate(NewPrediction),
}

/// Observation being classified, detached from where it came from
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub coin_id: &'a str,
    pub phase: Option<u8>,
    pub price: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub tick_id: Option<i64>,
}

impl<'a> From<&'a Tick> for Observation<'a> {
    fn from(tick: &'a Tick) -> Self {
        Self {
            coin_id: &tick.coin_id,
            phase: tick.phase,
            price: tick.price,
            timestamp: tick.timestamp,
            tick_id: Some(tick.id),
        }
    }
}

/// Applies the filter chain, scores, tags and records ignore windows
pub struct Classifier {
    scorer: Arc<dyn Scorer>,
    ignore_cache: Arc<dyn IgnoreCache>,
}

impl Classifier {
    pub fn new(scorer: Arc<dyn Scorer>, ignore_cache: Arc<dyn IgnoreCache>) -> Self {
        Self { scorer, ignore_cache }
    }

    /// Filters that run before any probability is needed
    pub fn admit(&self, model: &Model, obs: &Observation<'_>) -> Option<Decision> {
        if !model.is_active {
            return Some(Decision::Inactive);
        }
        if !model.accepts_coin(obs.coin_id) || !model.accepts_phase(obs.phase) {
            return Some(Decision::Filtered);
        }
        if !self.ignore_cache.should_process(model.id, obs.coin_id, obs.timestamp) {
            return Some(Decision::Ignored);
        }
        None
    }

    /// Tag an admitted observation and start its ignore window
    pub fn classify(&self, model: &Model, obs: &Observation<'_>, probability: Probability) -> NewPrediction {
        let tag = model.classify(probability.as_f64());
        self.ignore_cache.record(model, obs.coin_id, tag, obs.timestamp);

        NewPrediction::for_model(
            model,
            obs.coin_id,
            probability.as_f64(),
            tag,
            obs.timestamp,
            obs.price,
            obs.tick_id,
        )
    }

    /// Full chain for a tick and a single model
    pub fn decide(&self, model: &Model, tick: &Tick) -> Result<Decision> {
        let obs = Observation::from(tick);
        if let Some(decision) = self.admit(model, &obs) {
            return Ok(decision);
        }

        match self.scorer.probability(model, tick)? {
            Some(probability) => Ok(Decision::Candidate(self.classify(model, &obs, probability))),
            None => Ok(Decision::Unscored),
        }
    }

    /// Run a tick through every model. Errors stay with their model.
    pub fn classify_tick(&self, models: &[Model], tick: &Tick) -> Vec<NewPrediction> {
        let mut candidates = Vec::new();

        for model in models {
            match self.decide(model, tick) {
                Ok(Decision::Candidate(prediction)) => {
                    debug!(
                        "Tick {}: model {} tagged {} as {} (p={:.3})",
                        tick.id, model.id, tick.coin_id, prediction.tag, prediction.probability
                    );
                    candidates.push(prediction);
                }
                Ok(Decision::Unscored) => {
                    debug!("Tick {}: no score for model {}", tick.id, model.id);
                }
                Ok(_) => {}
                Err(e) => warn!("Tick {} skipped for model {}: {}", tick.id, model.id, e),
            }
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::PrecomputedScorer;
    use crate::test_support::{sample_model, tick};
    use coinalert_core::{CoinFilterMode, Tag};
    use coinalert_persistence::CoinIgnoreCache;

    fn classifier() -> Classifier {
        Classifier::new(Arc::new(PrecomputedScorer), Arc::new(CoinIgnoreCache::new()))
    }

    fn candidate(decision: Decision) -> NewPrediction {
        match decision {
            Decision::Candidate(p) => p,
            other => panic!("expected a candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_tags_per_threshold() {
        let c = classifier();
        let model = sample_model(1);

        for (i, (p, expected)) in [(0.75, Tag::Alert), (0.55, Tag::Positive), (0.3, Tag::Negative)]
            .into_iter()
            .enumerate()
        {
            let coin = format!("COIN{}", i);
            let decision = c.decide(&model, &tick(i as i64, &coin, 0, &[(1, p)])).unwrap();
            assert_eq!(candidate(decision).tag, expected);
        }
    }

    #[test]
    fn test_filter_order() {
        let c = classifier();
        let mut model = sample_model(1);
        let t = tick(1, "BTC", 0, &[(1, 0.9)]);

        model.is_active = false;
        assert_eq!(c.decide(&model, &t).unwrap(), Decision::Inactive);

        model.is_active = true;
        model.coin_filter_mode = CoinFilterMode::Whitelist;
        model.coin_whitelist = Some(["ETH".to_string()].into_iter().collect());
        assert_eq!(c.decide(&model, &t).unwrap(), Decision::Filtered);

        model.coin_filter_mode = CoinFilterMode::All;
        model.phases = Some([2].into_iter().collect());
        // tick without a phase fails a phase filter
        assert_eq!(c.decide(&model, &t).unwrap(), Decision::Filtered);

        model.phases = None;
        assert!(matches!(c.decide(&model, &t).unwrap(), Decision::Candidate(_)));
    }

    #[test]
    fn test_alert_window_suppresses_follow_up_ticks() {
        let c = classifier();
        let model = sample_model(1);

        candidate(c.decide(&model, &tick(1, "C", 0, &[(1, 0.9)])).unwrap());
        assert_eq!(
            c.decide(&model, &tick(2, "C", 10, &[(1, 0.9)])).unwrap(),
            Decision::Ignored
        );
        candidate(c.decide(&model, &tick(3, "C", 21, &[(1, 0.9)])).unwrap());
    }

    #[test]
    fn test_errors_are_isolated_per_model() {
        let c = classifier();
        let models = vec![sample_model(1), sample_model(2), sample_model(3)];
        let t = tick(1, "BTC", 0, &[(1, 0.8), (2, 1.7)]);

        let candidates = c.classify_tick(&models, &t);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].model_id, 1);
        assert_eq!(candidates[0].tick_id, Some(1));
    }
}
