//! Batch dispatcher: buffers classified predictions and persists them in
//! bounded batches from a single writer task

use crate::config::BatchConfig;
use crate::retry::backoff_delay;
use coinalert_core::{Error, NewPrediction, Prediction, PredictionStore, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A classified prediction waiting to be written
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub prediction: NewPrediction,
    /// Log cap of the prediction's category at classification time (0 = unbounded)
    pub cap: u32,
}

enum DispatchCommand {
    Submit(DispatchItem),
    /// Write everything received so far, then report whether any write is
    /// still waiting for a retry
    Flush(oneshot::Sender<bool>),
}

/// Item whose write failed transiently
struct PendingRetry {
    item: DispatchItem,
    attempts: u32,
    not_before: Instant,
}

/// Handle to feed the dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchCommand>,
}

impl DispatcherHandle {
    /// Queue a prediction. Waits while the channel is full.
    pub async fn submit(&self, prediction: NewPrediction, cap: u32) -> Result<()> {
        self.tx
            .send(DispatchCommand::Submit(DispatchItem { prediction, cap }))
            .await
            .map_err(|_| Error::ChannelClosed("batch dispatcher".to_string()))
    }

    /// Write every prediction submitted before this call.
    ///
    /// Resolves to true once all of them are stored, capped or dropped, and
    /// false while some still wait for a retry.
    pub async fn flush(&self) -> Result<bool> {
        let (ack, settled) = oneshot::channel();
        self.tx
            .send(DispatchCommand::Flush(ack))
            .await
            .map_err(|_| Error::ChannelClosed("batch dispatcher".to_string()))?;
        settled
            .await
            .map_err(|_| Error::ChannelClosed("batch dispatcher".to_string()))
    }
}

/// Counters reported by one flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub capped: usize,
    pub retrying: usize,
    pub dropped: usize,
}

struct Dispatcher {
    store: Arc<dyn PredictionStore>,
    events: broadcast::Sender<Prediction>,
    config: BatchConfig,
    buffer: Vec<DispatchItem>,
    first_buffered_at: Option<Instant>,
    retries: VecDeque<PendingRetry>,
}

impl Dispatcher {
    fn push(&mut self, item: DispatchItem) {
        if self.buffer.is_empty() {
            self.first_buffered_at = Some(Instant::now());
        }
        self.buffer.push(item);
    }

    fn is_full(&self) -> bool {
        self.buffer.len() >= self.config.max_batch_size
    }

    /// Earliest instant something has to happen without new input
    fn next_deadline(&self) -> Option<Instant> {
        let batch_due = self
            .first_buffered_at
            .map(|t| t + self.config.max_batch_wait());
        let retry_due = self.retries.iter().map(|r| r.not_before).min();

        match (batch_due, retry_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Write one item; transient failures go to the retry queue
    async fn write(&mut self, item: DispatchItem, attempts: u32, report: &mut FlushReport) {
        let written = self
            .store
            .insert_prediction_capped(&item.prediction, item.cap)
            .await;

        match written {
            Ok(Some(id)) => {
                let prediction = item.prediction.into_prediction(id);
                // no receivers is fine
                let _ = self.events.send(prediction);
                report.persisted += 1;
            }
            Ok(None) => {
                debug!(
                    "Cap reached or tick already recorded, dropping {} prediction for model {} / {}",
                    item.prediction.tag, item.prediction.model_id, item.prediction.coin_id
                );
                report.capped += 1;
            }
            Err(e) if e.is_transient() => {
                let attempts = attempts + 1;
                let delay = backoff_delay(
                    self.config.retry_base_delay_ms,
                    self.config.retry_max_delay_ms,
                    attempts,
                );
                warn!(
                    "Write failed for model {} / {} (attempt {}): {}, retrying in {}ms",
                    item.prediction.model_id,
                    item.prediction.coin_id,
                    attempts,
                    e,
                    delay.as_millis()
                );
                self.retries.push_back(PendingRetry {
                    item,
                    attempts,
                    not_before: Instant::now() + delay,
                });
                report.retrying += 1;
            }
            Err(e) => {
                error!(
                    "Dropping prediction for model {} / {}: {}",
                    item.prediction.model_id, item.prediction.coin_id, e
                );
                report.dropped += 1;
            }
        }
    }

    /// Persist the buffered batch, then every retry that is due
    /// (`force` ignores retry backoff, used on shutdown)
    async fn flush(&mut self, force: bool) -> FlushReport {
        let mut report = FlushReport::default();
        let now = Instant::now();

        let due: Vec<PendingRetry> = if force {
            self.retries.drain(..).collect()
        } else {
            let (due, waiting): (Vec<_>, Vec<_>) =
                self.retries.drain(..).partition(|r| r.not_before <= now);
            self.retries.extend(waiting);
            due
        };
        for retry in due {
            self.write(retry.item, retry.attempts, &mut report).await;
        }

        let batch = std::mem::take(&mut self.buffer);
        self.first_buffered_at = None;
        let size = batch.len();
        for item in batch {
            self.write(item, 0, &mut report).await;
        }

        if size > 0 || report.retrying > 0 {
            debug!(
                "Flushed batch of {}: {} persisted, {} capped, {} retrying, {} dropped",
                size, report.persisted, report.capped, report.retrying, report.dropped
            );
        }
        report
    }

    async fn handle(&mut self, command: DispatchCommand) {
        match command {
            DispatchCommand::Submit(item) => {
                self.push(item);
                if self.is_full() {
                    self.flush(false).await;
                }
            }
            DispatchCommand::Flush(ack) => {
                self.flush(false).await;
                // the requester may have given up waiting
                let _ = ack.send(self.retries.is_empty());
            }
        }
    }

    fn batch_wait_elapsed(&self, now: Instant) -> bool {
        self.first_buffered_at
            .map_or(false, |t| now >= t + self.config.max_batch_wait())
    }
}

/// Spawn the dispatcher task.
///
/// Returns the handle producers submit through and the task's join handle.
pub fn spawn_dispatcher(
    store: Arc<dyn PredictionStore>,
    events: broadcast::Sender<Prediction>,
    config: BatchConfig,
    channel_capacity: usize,
    cancel_token: CancellationToken,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<DispatchCommand>(channel_capacity.max(1));

    let dispatcher = Dispatcher {
        store,
        events,
        buffer: Vec::with_capacity(config.max_batch_size),
        config,
        first_buffered_at: None,
        retries: VecDeque::new(),
    };

    let task = tokio::spawn(dispatcher_loop(dispatcher, rx, cancel_token));
    (DispatcherHandle { tx }, task)
}

async fn dispatcher_loop(
    mut dispatcher: Dispatcher,
    mut rx: mpsc::Receiver<DispatchCommand>,
    cancel_token: CancellationToken,
) {
    info!(
        "Batch dispatcher started (size: {}, wait: {}ms)",
        dispatcher.config.max_batch_size, dispatcher.config.max_batch_wait_ms
    );

    loop {
        let deadline = dispatcher.next_deadline();
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = cancel_token.cancelled() => {
                rx.close();
                while let Some(command) = rx.recv().await {
                    dispatcher.handle(command).await;
                }
                break;
            }
            received = rx.recv() => match received {
                Some(command) => dispatcher.handle(command).await,
                None => break,
            },
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                let now = Instant::now();
                if dispatcher.batch_wait_elapsed(now) || dispatcher.retries.iter().any(|r| r.not_before <= now) {
                    dispatcher.flush(false).await;
                }
            }
        }
    }

    let report = dispatcher.flush(true).await;
    if !dispatcher.retries.is_empty() {
        error!(
            "Batch dispatcher stopped with {} unwritten predictions",
            dispatcher.retries.len()
        );
    }
    info!("Batch dispatcher stopped (final flush persisted {})", report.persisted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{new_prediction, seeded_db, FlakyStore};
    use coinalert_core::Tag;

    fn config(size: usize, wait_ms: u64) -> BatchConfig {
        BatchConfig {
            max_batch_size: size,
            max_batch_wait_ms: wait_ms,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_flushes_when_batch_is_full() {
        let (db, model) = seeded_db().await;
        let store = Arc::new(db);
        let (events, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_dispatcher(
            store.clone(),
            events,
            config(2, 60_000),
            16,
            cancel.clone(),
        );

        handle.submit(new_prediction(&model, "A", 0.9, Tag::Alert, 0), 0).await.unwrap();
        handle.submit(new_prediction(&model, "B", 0.9, Tag::Alert, 0), 0).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.coin_id, "A");
        assert_eq!(second.coin_id, "B");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_flushes_after_wait() {
        let (db, model) = seeded_db().await;
        let store = Arc::new(db);
        let (events, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_dispatcher(
            store.clone(),
            events,
            config(50, 50),
            16,
            cancel.clone(),
        );

        handle.submit(new_prediction(&model, "A", 0.9, Tag::Alert, 0), 0).await.unwrap();

        let persisted = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(persisted.model_id, model.id);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_batch() {
        let (db, model) = seeded_db().await;
        let store = Arc::new(db);
        let (events, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_dispatcher(
            store.clone(),
            events,
            config(50, 60_000),
            16,
            cancel.clone(),
        );

        handle.submit(new_prediction(&model, "A", 0.9, Tag::Alert, 0), 0).await.unwrap();
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(rx.recv().await.unwrap().coin_id, "A");
    }

    #[tokio::test]
    async fn test_cap_applies_within_one_batch() {
        let (db, model) = seeded_db().await;
        let store = Arc::new(db);
        let (events, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_dispatcher(
            store.clone(),
            events,
            config(2, 60_000),
            16,
            cancel.clone(),
        );

        handle.submit(new_prediction(&model, "C", 0.9, Tag::Alert, 0), 1).await.unwrap();
        handle.submit(new_prediction(&model, "C", 0.95, Tag::Alert, 5), 1).await.unwrap();
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(rx.recv().await.unwrap().probability, 0.9);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (db, model) = seeded_db().await;
        let store = Arc::new(FlakyStore::new(db, 2));
        let (events, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_dispatcher(
            store.clone(),
            events,
            config(1, 60_000),
            16,
            cancel.clone(),
        );

        handle.submit(new_prediction(&model, "A", 0.9, Tag::Alert, 0), 0).await.unwrap();

        let persisted = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(persisted.coin_id, "A");
        assert_eq!(store.failures_left(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_writes_before_acknowledging() {
        let (db, model) = seeded_db().await;
        let store = Arc::new(db);
        let (events, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_dispatcher(store.clone(), events, config(50, 60_000), 16, cancel.clone());

        handle.submit(new_prediction(&model, "A", 0.9, Tag::Alert, 0), 0).await.unwrap();
        handle.submit(new_prediction(&model, "B", 0.2, Tag::Negative, 0), 0).await.unwrap();
        assert!(handle.flush().await.unwrap());

        let stored = store.list_predictions(&Default::default()).await.unwrap();
        assert_eq!(stored.len(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_reports_pending_retries() {
        let (db, model) = seeded_db().await;
        let store = Arc::new(FlakyStore::new(db, 1));
        let (events, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_dispatcher(store.clone(), events, config(50, 60_000), 16, cancel.clone());

        handle.submit(new_prediction(&model, "A", 0.9, Tag::Alert, 0), 0).await.unwrap();
        assert!(!handle.flush().await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.flush().await.unwrap());
        assert_eq!(store.list_predictions(&Default::default()).await.unwrap().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
