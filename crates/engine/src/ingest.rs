//! Tick ingestion: a push path and a polling path feeding one consumer
//! that deduplicates on tick id

use crate::config::IngestConfig;
use crate::dispatcher::DispatcherHandle;
use crate::pipeline::Classifier;
use crate::registry::ModelRegistry;
use coinalert_core::{Error, Result, Tick, TickPoller};
use coinalert_persistence::{sqlite, Database};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings-table key of the last polled tick id
pub const CURSOR_KEY: &str = "ingest_cursor";

/// Remembers the last `capacity` tick ids
pub struct DedupWindow {
    seen: HashSet<i64>,
    order: VecDeque<i64>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id was already seen inside the window
    pub fn insert(&mut self, tick_id: i64) -> bool {
        if !self.seen.insert(tick_id) {
            return false;
        }
        self.order.push_back(tick_id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Polled ticks handled between two cursor checkpoints at most
const CURSOR_CHECKPOINT_EVERY: usize = 100;

/// What travels from the producers to the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// From a push notification; never moves the cursor
    Pushed(Tick),
    /// From the poller
    Polled(Tick),
    /// The poller caught up: every row up to `cursor` was delivered or was
    /// undecodable
    Drained { cursor: i64 },
}

/// Push side of the tick feed (database notifications, webhooks)
#[derive(Clone)]
pub struct TickPushHandle {
    tx: mpsc::Sender<Delivery>,
}

impl TickPushHandle {
    pub(crate) fn new(tx: mpsc::Sender<Delivery>) -> Self {
        Self { tx }
    }

    /// Deliver a tick, waiting while the channel is full
    pub async fn notify(&self, tick: Tick) -> Result<()> {
        self.tx
            .send(Delivery::Pushed(tick))
            .await
            .map_err(|_| Error::ChannelClosed("tick ingestion".to_string()))
    }

    /// Deliver a tick without waiting; fails when the channel is full
    pub fn try_notify(&self, tick: Tick) -> Result<()> {
        self.tx.try_send(Delivery::Pushed(tick)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::ChannelClosed("tick ingestion full, tick not queued".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed("tick ingestion".to_string()),
        })
    }
}

/// Last polled tick id stored in `db`, 0 when never polled
pub async fn load_cursor(db: &Database) -> Result<i64> {
    Ok(sqlite::get_setting::<i64>(db.pool(), CURSOR_KEY).await?.unwrap_or(0))
}

/// Spawn the polling producer.
///
/// Pages through `poll_ticks` until a short page, then sleeps
/// `poll_interval_secs`. The poller only tracks its read position; the
/// persisted cursor is owned by the consumer.
pub fn spawn_tick_poller(
    poller: Arc<dyn TickPoller>,
    tx: mpsc::Sender<Delivery>,
    config: IngestConfig,
    start_after: i64,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.poll_interval_secs.max(1));
        let limit = config.poll_batch_limit.max(1);
        let mut cursor = start_after;
        info!("Tick poller started (interval: {}s, cursor: {})", interval.as_secs(), cursor);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Tick poller cancelled, exiting");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    match poll_once(poller.as_ref(), &tx, &mut cursor, limit).await {
                        Ok(0) => {}
                        Ok(n) => debug!("Polled {} ticks (cursor: {})", n, cursor),
                        Err(Error::ChannelClosed(_)) => {
                            info!("Tick channel closed, poller exiting");
                            break;
                        }
                        Err(e) => warn!("Tick poll failed: {}", e),
                    }
                }
            }
        }
    })
}

/// Drain everything newer than `cursor` into the channel, then mark the
/// drain with [`Delivery::Drained`] if the cursor moved
pub async fn poll_once(
    poller: &dyn TickPoller,
    tx: &mpsc::Sender<Delivery>,
    cursor: &mut i64,
    limit: u32,
) -> Result<usize> {
    let closed = || Error::ChannelClosed("tick ingestion".to_string());
    let start = *cursor;
    let mut delivered = 0;

    loop {
        let page = poller.poll_ticks(*cursor, limit).await?;
        let rows = page.rows();
        if page.skipped > 0 {
            warn!("Skipped {} undecodable ticks after id {}", page.skipped, cursor);
        }

        for tick in page.ticks {
            let id = tick.id;
            tx.send(Delivery::Polled(tick)).await.map_err(|_| closed())?;
            *cursor = (*cursor).max(id);
            delivered += 1;
        }
        if let Some(last_id) = page.last_id {
            *cursor = (*cursor).max(last_id);
        }

        if rows < limit as usize {
            break;
        }
    }

    if *cursor > start {
        tx.send(Delivery::Drained { cursor: *cursor }).await.map_err(|_| closed())?;
    }
    Ok(delivered)
}

/// Polled position the consumer has fully handled, and the last one saved
/// this run. Both only ever grow, and the poller starts past the stored
/// cursor, so starting from zero never moves the stored cursor back.
#[derive(Default)]
struct CursorCheckpoint {
    db: Option<Database>,
    handled: i64,
    saved: i64,
    since_save: usize,
}

impl CursorCheckpoint {
    fn new(db: Option<Database>) -> Self {
        Self {
            db,
            ..Default::default()
        }
    }

    fn advance(&mut self, id: i64) {
        self.handled = self.handled.max(id);
        self.since_save += 1;
    }

    /// Save the handled position once the dispatcher has written every
    /// prediction derived from it
    async fn save(&mut self, dispatcher: &DispatcherHandle) {
        let Some(db) = &self.db else { return };
        if self.handled <= self.saved {
            return;
        }

        match dispatcher.flush().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Predictions still waiting for a retry, cursor stays at {}", self.saved);
                return;
            }
            Err(e) => {
                warn!("Could not flush before saving the ingest cursor: {}", e);
                return;
            }
        }

        match sqlite::set_setting(db.pool(), CURSOR_KEY, &self.handled).await {
            Ok(()) => {
                self.saved = self.handled;
                self.since_save = 0;
            }
            Err(e) => warn!("Could not persist ingest cursor {}: {}", self.handled, e),
        }
    }
}

/// Spawn the single consumer that classifies ticks and feeds the dispatcher.
///
/// Polled ticks move the persisted cursor (in `cursor_db`, when given) only
/// after their predictions are written, so a restart replays rather than
/// skips. On cancellation the channel is closed and drained, so queued ticks
/// still reach the dispatcher.
pub fn spawn_tick_consumer(
    mut rx: mpsc::Receiver<Delivery>,
    dedup_window: usize,
    registry: Arc<ModelRegistry>,
    classifier: Arc<Classifier>,
    dispatcher: DispatcherHandle,
    cursor_db: Option<Database>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut dedup = DedupWindow::new(dedup_window);
        let mut checkpoint = CursorCheckpoint::new(cursor_db);
        info!("Tick consumer started");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    rx.close();
                    while let Some(delivery) = rx.recv().await {
                        consume(delivery, &mut dedup, &mut checkpoint, &registry, &classifier, &dispatcher).await;
                    }
                    info!("Tick consumer cancelled, exiting");
                    break;
                }
                received = rx.recv() => match received {
                    Some(delivery) => {
                        consume(delivery, &mut dedup, &mut checkpoint, &registry, &classifier, &dispatcher).await;
                    }
                    None => {
                        info!("Tick channel closed, consumer exiting");
                        break;
                    }
                },
            }
        }

        checkpoint.save(&dispatcher).await;
    })
}

async fn consume(
    delivery: Delivery,
    dedup: &mut DedupWindow,
    checkpoint: &mut CursorCheckpoint,
    registry: &ModelRegistry,
    classifier: &Classifier,
    dispatcher: &DispatcherHandle,
) {
    match delivery {
        Delivery::Pushed(tick) => process_tick(&tick, dedup, registry, classifier, dispatcher).await,
        Delivery::Polled(tick) => {
            process_tick(&tick, dedup, registry, classifier, dispatcher).await;
            checkpoint.advance(tick.id);
            if checkpoint.since_save >= CURSOR_CHECKPOINT_EVERY {
                checkpoint.save(dispatcher).await;
            }
        }
        Delivery::Drained { cursor } => {
            checkpoint.handled = checkpoint.handled.max(cursor);
            checkpoint.save(dispatcher).await;
        }
    }
}

async fn process_tick(
    tick: &Tick,
    dedup: &mut DedupWindow,
    registry: &ModelRegistry,
    classifier: &Classifier,
    dispatcher: &DispatcherHandle,
) {
    if !dedup.insert(tick.id) {
        debug!("Tick {} already processed", tick.id);
        return;
    }

    let models = registry.active_models();
    for prediction in classifier.classify_tick(&models, tick) {
        let cap = models
            .iter()
            .find(|m| m.id == prediction.model_id)
            .map_or(0, |m| m.max_log_entries(prediction.tag));

        if let Err(e) = dispatcher.submit(prediction, cap).await {
            error!("Tick {}: {}", tick.id, e);
        }
    }
}
