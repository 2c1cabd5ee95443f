//! Shared type definitions and newtypes

use serde::{Deserialize, Serialize};

/// Price per coin (quote currency)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Price(pub f64);

impl Price {
    pub fn new(price: f64) -> Self {
        Price(price)
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// A price usable as the base of a percentage change
    pub fn is_valid_base(&self) -> bool {
        self.0.is_finite() && self.0 > 0.0
    }
}

/// Percentage value (e.g. 5.0 = +5%)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Percent(pub f64);

impl Percent {
    pub fn new(value: f64) -> Self {
        Percent(value)
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Percentage change from `base` to `price`
    pub fn change(base: Price, price: Price) -> Self {
        Percent((price.0 - base.0) / base.0 * 100.0)
    }
}

/// Model score for a tick, always within [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Probability(f64);

impl Probability {
    /// Validate a raw score. NaN and values outside [0, 1] are rejected.
    pub fn new(value: f64) -> Option<Self> {
        if (0.0..=1.0).contains(&value) {
            Some(Probability(value))
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_change() {
        let pct = Percent::change(Price(100.0), Price(106.0));
        assert!((pct.as_f64() - 6.0).abs() < 1e-9);

        let pct = Percent::change(Price(200.0), Price(150.0));
        assert!((pct.as_f64() + 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_probability_bounds() {
        assert!(Probability::new(0.0).is_some());
        assert!(Probability::new(1.0).is_some());
        assert!(Probability::new(1.01).is_none());
        assert!(Probability::new(-0.1).is_none());
        assert!(Probability::new(f64::NAN).is_none());
    }

    #[test]
    fn test_price_base_validity() {
        assert!(Price(0.5).is_valid_base());
        assert!(!Price(0.0).is_valid_base());
        assert!(!Price(f64::INFINITY).is_valid_base());
    }
}
