//! Raw coin-metric observations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One raw coin-metric observation ingested by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Monotonic id of the source row, used to deduplicate deliveries
    pub id: i64,
    pub coin_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub phase: Option<u8>,
    #[serde(default)]
    pub price: Option<f64>,
    /// Precomputed probability per model id
    #[serde(default)]
    pub scores: BTreeMap<i64, f64>,
}

/// One poll of the tick feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickPage {
    pub ticks: Vec<Tick>,
    /// Rows in the page that could not be decoded
    pub skipped: usize,
    /// Highest source id the page covered, skipped rows included
    pub last_id: Option<i64>,
}

impl TickPage {
    pub fn new(ticks: Vec<Tick>) -> Self {
        let last_id = ticks.iter().map(|t| t.id).max();
        Self {
            ticks,
            skipped: 0,
            last_id,
        }
    }

    /// Rows the page consumed from the feed
    pub fn rows(&self) -> usize {
        self.ticks.len() + self.skipped
    }
}

/// A point of a coin's price series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}
