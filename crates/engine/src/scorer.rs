//! Probability scoring of ticks

use coinalert_core::{Error, Model, Probability, Result, Tick};

/// Produces a model's probability for a tick.
///
/// `Ok(None)` means the model has nothing to say about this tick and it is
/// skipped; an out-of-range score is an error for that tick only.
pub trait Scorer: Send + Sync {
    fn probability(&self, model: &Model, tick: &Tick) -> Result<Option<Probability>>;
}

/// Reads the score an upstream model already wrote onto the tick
#[derive(Debug, Default, Clone, Copy)]
pub struct PrecomputedScorer;

impl Scorer for PrecomputedScorer {
    fn probability(&self, model: &Model, tick: &Tick) -> Result<Option<Probability>> {
        match tick.scores.get(&model.id) {
            None => Ok(None),
            Some(&raw) => Probability::new(raw).map(Some).ok_or_else(|| {
                Error::InvalidData(format!(
                    "tick {}: score {} for model {} is outside [0, 1]",
                    tick.id, raw, model.id
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_model, tick};

    #[test]
    fn test_reads_score_for_model() {
        let model = sample_model(3);
        let t = tick(1, "BTC", 0, &[(3, 0.8), (4, 0.1)]);

        let p = PrecomputedScorer.probability(&model, &t).unwrap().unwrap();
        assert_eq!(p.as_f64(), 0.8);
    }

    #[test]
    fn test_missing_score_is_skip() {
        let model = sample_model(3);
        let t = tick(1, "BTC", 0, &[(4, 0.9)]);

        assert!(PrecomputedScorer.probability(&model, &t).unwrap().is_none());
    }

    #[test]
    fn test_out_of_range_score_is_error() {
        let model = sample_model(3);
        for raw in [1.5, -0.1, f64::NAN] {
            let t = tick(1, "BTC", 0, &[(3, raw)]);
            assert!(matches!(
                PrecomputedScorer.probability(&model, &t),
                Err(Error::InvalidData(_))
            ));
        }
    }
}
