//! In-memory coin-ignore cache

use chrono::{DateTime, Utc};
use coinalert_core::{IgnoreCache, Model, Tag};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Suppression window for one (model, coin) pair
#[derive(Debug, Clone, Copy)]
struct IgnoreEntry {
    ignored_until: DateTime<Utc>,
    tag: Tag,
}

impl IgnoreEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ignored_until
    }
}

/// Thread-safe per (model, coin) ignore windows with lazy expiry.
///
/// Every lock failure falls back to "process", so a broken cache only costs
/// the suppression, never a tick.
pub struct CoinIgnoreCache {
    entries: RwLock<HashMap<(i64, String), IgnoreEntry>>,
    max_entries: usize,
}

impl CoinIgnoreCache {
    /// Create a cache holding at most `max_entries` live windows
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    /// When the pair's window ends, if one is live
    pub fn ignored_until(&self, model_id: i64, coin_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&(model_id, coin_id.to_string()))?;
        if entry.is_expired(now) {
            None
        } else {
            Some(entry.ignored_until)
        }
    }

    /// Clear entire cache
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Current number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CoinIgnoreCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IgnoreCache for CoinIgnoreCache {
    fn should_process(&self, model_id: i64, coin_id: &str, now: DateTime<Utc>) -> bool {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(_) => {
                warn!("Ignore cache lock poisoned, processing {} for model {}", coin_id, model_id);
                return true;
            }
        };

        match entries.get(&(model_id, coin_id.to_string())) {
            Some(entry) if !entry.is_expired(now) => {
                debug!(
                    "Model {}: {} ignored until {} (last tag {})",
                    model_id, coin_id, entry.ignored_until, entry.tag
                );
                false
            }
            _ => true,
        }
    }

    fn record(&self, model: &Model, coin_id: &str, tag: Tag, now: DateTime<Utc>) {
        let duration = model.ignore_duration(tag);
        if duration.is_zero() {
            return;
        }

        let Ok(mut entries) = self.entries.write() else {
            warn!("Ignore cache lock poisoned, not recording {} for model {}", coin_id, model.id);
            return;
        };

        // Evict expired entries if at capacity
        if entries.len() >= self.max_entries {
            entries.retain(|_, entry| !entry.is_expired(now));
        }

        // If still at capacity after cleanup, evict the window ending soonest
        if entries.len() >= self.max_entries {
            if let Some(soonest) = entries
                .iter()
                .min_by_key(|(_, e)| e.ignored_until)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&soonest);
            }
        }

        entries.insert(
            (model.id, coin_id.to_string()),
            IgnoreEntry {
                ignored_until: now + duration,
                tag,
            },
        );
    }

    fn reap(&self, now: DateTime<Utc>) -> usize {
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, entry| !entry.is_expired(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    fn clear_model(&self, model_id: i64) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|(id, _), _| *id != model_id);
        }
    }
}
