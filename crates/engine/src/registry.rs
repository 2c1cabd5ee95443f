//! In-memory snapshot of the active models

use coinalert_core::{Model, ModelStore, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Active models as last read from the configuration store.
///
/// Readers get a cheap `Arc` snapshot; a refresh swaps the whole list.
pub struct ModelRegistry {
    store: Arc<dyn ModelStore>,
    active: RwLock<Arc<Vec<Model>>>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self {
            store,
            active: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Re-read the active models from the store
    pub async fn refresh(&self) -> Result<usize> {
        let models = self.store.list_active_models().await?;
        let count = models.len();
        if let Ok(mut active) = self.active.write() {
            *active = Arc::new(models);
        }
        debug!("Model registry refreshed: {} active", count);
        Ok(count)
    }

    /// Current snapshot of active models
    pub fn active_models(&self) -> Arc<Vec<Model>> {
        self.active
            .read()
            .map(|a| Arc::clone(&*a))
            .unwrap_or_default()
    }

    pub fn get(&self, model_id: i64) -> Option<Model> {
        self.active_models().iter().find(|m| m.id == model_id).cloned()
    }
}

/// Spawn the periodic registry refresh
pub fn spawn_registry_refresh(
    registry: Arc<ModelRegistry>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Model registry refresh started (interval: {}s)", interval.as_secs());
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Model registry refresh cancelled, exiting");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = registry.refresh().await {
                        error!("Model registry refresh failed: {}", e);
                    }
                }
            }
        }
    })
}
