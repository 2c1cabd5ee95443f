//! Engine lifecycle: wires the components together and owns the
//! background tasks

use crate::config::{EngineConfig, PriceSourceKind};
use crate::dispatcher::spawn_dispatcher;
use crate::evaluation::{spawn_evaluation_workers, EvaluationScheduler};
use crate::ingest::{load_cursor, spawn_tick_consumer, spawn_tick_poller, TickPushHandle};
use crate::pipeline::Classifier;
use crate::registry::{spawn_registry_refresh, ModelRegistry};
use crate::scorer::{PrecomputedScorer, Scorer};
use crate::service::AlertService;
use crate::statistics::StatisticsAggregator;
use chrono::Utc;
use coinalert_core::{IgnoreCache, Prediction, PriceSource, Result, TickPoller};
use coinalert_networking::MetricsClient;
use coinalert_persistence::{CoinIgnoreCache, Database};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Capacity of the persisted-prediction broadcast
const EVENT_CAPACITY: usize = 1024;

/// Collaborators the engine runs against
pub struct EngineDeps {
    pub db: Database,
    pub prices: Arc<dyn PriceSource>,
    pub ticks: Arc<dyn TickPoller>,
    pub scorer: Arc<dyn Scorer>,
    pub ignore_cache: Arc<dyn IgnoreCache>,
}

impl EngineDeps {
    /// Default collaborators for `config`: the database for everything, or
    /// the metrics service for prices and ticks
    pub fn from_config(config: &EngineConfig, db: Database) -> Result<Self> {
        let (prices, ticks): (Arc<dyn PriceSource>, Arc<dyn TickPoller>) = match config.price_source.kind {
            PriceSourceKind::Sqlite => (Arc::new(db.clone()), Arc::new(db.clone())),
            PriceSourceKind::Http => {
                let base_url = config.price_source.base_url.as_deref().unwrap_or_default();
                let mut client = MetricsClient::new(base_url, config.evaluation.fetch_timeout())?;
                if let Some(key) = &config.price_source.api_key {
                    client = client.with_api_key(key);
                }
                let client = Arc::new(client);
                (client.clone(), client)
            }
        };

        Ok(Self {
            db,
            prices,
            ticks,
            scorer: Arc::new(PrecomputedScorer),
            ignore_cache: Arc::new(CoinIgnoreCache::new()),
        })
    }
}

/// Running engine.
///
/// Shutdown happens in stages so nothing in flight is lost: ingestion
/// drains into the dispatcher, the dispatcher flushes, then the remaining
/// background loops stop.
pub struct EngineHandle {
    service: AlertService,
    push: TickPushHandle,
    events: broadcast::Sender<Prediction>,
    scheduler: Arc<EvaluationScheduler>,
    ingest_cancel: CancellationToken,
    dispatch_cancel: CancellationToken,
    background_cancel: CancellationToken,
    ingest_tasks: Vec<JoinHandle<()>>,
    dispatch_task: JoinHandle<()>,
    background_tasks: Vec<JoinHandle<()>>,
}

pub struct Engine;

impl Engine {
    /// Build every component and spawn the background tasks
    pub async fn start(config: EngineConfig, deps: EngineDeps) -> Result<EngineHandle> {
        config.validate()?;
        let db = Arc::new(deps.db.clone());

        let registry = Arc::new(ModelRegistry::new(db.clone()));
        let active = registry.refresh().await?;
        let statistics = Arc::new(StatisticsAggregator::new(db.clone()));
        let classifier = Arc::new(Classifier::new(deps.scorer.clone(), deps.ignore_cache.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let ingest_cancel = CancellationToken::new();
        let dispatch_cancel = CancellationToken::new();
        let background_cancel = CancellationToken::new();

        let (dispatcher, dispatch_task) = spawn_dispatcher(
            db.clone(),
            events.clone(),
            config.batch.clone(),
            config.ingest.channel_capacity,
            dispatch_cancel.clone(),
        );

        let (tick_tx, tick_rx) = mpsc::channel(config.ingest.channel_capacity);
        let polling = config.ingest.poll_interval_secs > 0;
        let mut ingest_tasks = vec![spawn_tick_consumer(
            tick_rx,
            config.ingest.dedup_window,
            registry.clone(),
            classifier.clone(),
            dispatcher,
            polling.then(|| deps.db.clone()),
            ingest_cancel.clone(),
        )];
        if polling {
            let cursor = load_cursor(&deps.db).await?;
            ingest_tasks.push(spawn_tick_poller(
                deps.ticks.clone(),
                tick_tx.clone(),
                config.ingest.clone(),
                cursor,
                ingest_cancel.clone(),
            ));
        }

        let scheduler = Arc::new(EvaluationScheduler::new(
            db.clone(),
            deps.prices.clone(),
            config.evaluation.clone(),
        ));
        scheduler.release_stale_claims(Utc::now()).await?;

        let mut background_tasks = spawn_evaluation_workers(scheduler.clone(), background_cancel.clone());
        background_tasks.push(spawn_registry_refresh(
            registry.clone(),
            Duration::from_secs(config.registry.refresh_interval_secs.max(1)),
            background_cancel.clone(),
        ));
        background_tasks.push(spawn_ignore_reaper(
            deps.ignore_cache.clone(),
            Duration::from_secs(config.ignore.reap_interval_secs.max(1)),
            background_cancel.clone(),
        ));

        let service = AlertService::new(
            db.clone(),
            db,
            deps.ignore_cache,
            registry,
            classifier,
            statistics,
        );

        info!(
            "Engine started: {} active models, {} evaluation workers",
            active, config.evaluation.workers
        );

        Ok(EngineHandle {
            service,
            push: TickPushHandle::new(tick_tx),
            events,
            scheduler,
            ingest_cancel,
            dispatch_cancel,
            background_cancel,
            ingest_tasks,
            dispatch_task,
            background_tasks,
        })
    }
}

impl EngineHandle {
    pub fn service(&self) -> &AlertService {
        &self.service
    }

    /// Push path of the tick feed
    pub fn push_handle(&self) -> TickPushHandle {
        self.push.clone()
    }

    /// Predictions as they are persisted by the dispatcher
    pub fn subscribe(&self) -> broadcast::Receiver<Prediction> {
        self.events.subscribe()
    }

    /// The evaluation scheduler, for on-demand sweeps
    pub fn scheduler(&self) -> Arc<EvaluationScheduler> {
        self.scheduler.clone()
    }

    /// Stop ingestion, flush the dispatcher, then stop the background loops
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        drop(self.push);

        self.ingest_cancel.cancel();
        for task in self.ingest_tasks {
            if let Err(e) = task.await {
                error!("Ingestion task ended abnormally: {}", e);
            }
        }

        self.dispatch_cancel.cancel();
        if let Err(e) = self.dispatch_task.await {
            error!("Dispatcher task ended abnormally: {}", e);
        }

        self.background_cancel.cancel();
        for task in self.background_tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }
}

/// Spawn the periodic compaction of expired ignore entries
pub fn spawn_ignore_reaper(
    cache: Arc<dyn IgnoreCache>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let removed = cache.reap(Utc::now());
                    if removed > 0 {
                        debug!("Reaped {} expired ignore entries", removed);
                    }
                }
            }
        }
    })
}
