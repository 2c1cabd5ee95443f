//! Engine configuration
//!
//! Loaded from TOML, then overlaid with the JSON kept under
//! [`SETTINGS_KEY`] in the settings table.

use coinalert_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings-table key holding runtime overrides
pub const SETTINGS_KEY: &str = "engine_config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub ignore: IgnoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub price_source: PriceSourceConfig,
}

fn default_database_path() -> PathBuf { PathBuf::from("data/coinalert.db") }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            ingest: IngestConfig::default(),
            batch: BatchConfig::default(),
            evaluation: EvaluationConfig::default(),
            ignore: IgnoreConfig::default(),
            registry: RegistryConfig::default(),
            price_source: PriceSourceConfig::default(),
        }
    }
}

/// Tick ingestion (push + poll)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Seconds between polls of the tick feed (0 = push only)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_batch_limit")]
    pub poll_batch_limit: u32,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How many recent tick ids are remembered for deduplication
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_poll_interval_secs() -> u64 { 30 }
fn default_poll_batch_limit() -> u32 { 500 }
fn default_channel_capacity() -> usize { 1024 }
fn default_dedup_window() -> usize { 10_000 }

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_batch_limit: default_poll_batch_limit(),
            channel_capacity: default_channel_capacity(),
            dedup_window: default_dedup_window(),
        }
    }
}

/// Batch dispatcher limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Longest time the first buffered item waits before a flush
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,
    /// Base delay in milliseconds before retrying a failed write (exponential backoff)
    #[serde(default = "default_batch_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_batch_retry_max_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_batch_size() -> usize { 50 }
fn default_max_batch_wait_ms() -> u64 { 5000 }
fn default_batch_retry_base_ms() -> u64 { 500 }
fn default_batch_retry_max_ms() -> u64 { 30_000 }

impl BatchConfig {
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            retry_base_delay_ms: default_batch_retry_base_ms(),
            retry_max_delay_ms: default_batch_retry_max_ms(),
        }
    }
}

/// Evaluation scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds between sweeps of a worker
    #[serde(default = "default_evaluation_interval_secs")]
    pub interval_secs: u64,
    /// Max predictions claimed per sweep
    #[serde(default = "default_claim_limit")]
    pub claim_limit: u32,
    /// Transient failures tolerated before a prediction is expired
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_evaluation_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    /// Past this age (since the evaluation instant) a failing prediction is expired
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Claims older than this are considered orphaned
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    /// Largest gap allowed between either end of the window and the nearest
    /// price point before the window counts as uncovered
    #[serde(default = "default_coverage_tolerance_secs")]
    pub coverage_tolerance_secs: u64,
}

fn default_workers() -> usize { 2 }
fn default_evaluation_interval_secs() -> u64 { 5 }
fn default_claim_limit() -> u32 { 100 }
fn default_max_attempts() -> u32 { 5 }
fn default_evaluation_retry_base_ms() -> u64 { 1000 }
fn default_max_staleness_secs() -> u64 { 3600 }
fn default_fetch_timeout_ms() -> u64 { 10_000 }
fn default_claim_timeout_secs() -> u64 { 300 }
fn default_coverage_tolerance_secs() -> u64 { 60 }

impl EvaluationConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn coverage_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.coverage_tolerance_secs.min(i64::MAX as u64) as i64)
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            interval_secs: default_evaluation_interval_secs(),
            claim_limit: default_claim_limit(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_evaluation_retry_base_ms(),
            max_staleness_secs: default_max_staleness_secs(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            claim_timeout_secs: default_claim_timeout_secs(),
            coverage_tolerance_secs: default_coverage_tolerance_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoreConfig {
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_reap_interval_secs() -> u64 { 60 }

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_refresh_interval_secs() -> u64 { 30 }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

/// Where price series and polled ticks come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceSourceKind {
    /// The `coin_metrics` table of the engine database
    #[default]
    Sqlite,
    /// The remote metrics service
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PriceSourceConfig {
    #[serde(default)]
    pub kind: PriceSourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl EngineConfig {
    /// Parse a TOML document; absent keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::InvalidConfig(format!("{}: {}", path.display(), e))),
        }
    }

    /// Overlay stored overrides (a partial JSON object) on top of this config
    pub fn with_overrides(&self, overrides: &serde_json::Value) -> Result<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, overrides);
        let config: Self = serde_json::from_value(merged)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", SETTINGS_KEY, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.max_batch_size == 0 {
            return Err(Error::InvalidConfig("batch.max_batch_size must be positive".to_string()));
        }
        if self.ingest.channel_capacity == 0 {
            return Err(Error::InvalidConfig("ingest.channel_capacity must be positive".to_string()));
        }
        if self.evaluation.workers == 0 {
            return Err(Error::InvalidConfig("evaluation.workers must be positive".to_string()));
        }
        if self.evaluation.claim_limit == 0 {
            return Err(Error::InvalidConfig("evaluation.claim_limit must be positive".to_string()));
        }
        if self.price_source.kind == PriceSourceKind::Http && self.price_source.base_url.is_none() {
            return Err(Error::InvalidConfig(
                "price_source.base_url is required for the http source".to_string(),
            ));
        }
        Ok(())
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
