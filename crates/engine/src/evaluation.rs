//! Evaluation scheduler: turns due predictions into success / failed /
//! expired outcomes using the coin's price series

use crate::config::EvaluationConfig;
use crate::retry::backoff_delay;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use coinalert_core::{
    Error, Evaluation, EvaluationResult, Percent, Prediction, PredictionStore, Price, PricePoint,
    PriceSource, Result, TargetDirection,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time range a prediction is judged over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Allowed gap between each end of the range and its nearest price point
    pub tolerance: ChronoDuration,
}

impl EvaluationWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>, tolerance: ChronoDuration) -> Self {
        Self { from, to, tolerance }
    }

    pub fn for_prediction(prediction: &Prediction, tolerance: ChronoDuration) -> Self {
        Self::new(prediction.prediction_timestamp, prediction.evaluation_timestamp, tolerance)
    }

    fn is_covered_by(&self, first: &PricePoint, last: &PricePoint) -> bool {
        first.timestamp <= self.from + self.tolerance && last.timestamp >= self.to - self.tolerance
    }
}

/// Outcome of a price window for a target move.
///
/// `points` must be ordered by time. The first point is the base price,
/// the last one the end price. A window whose start or end has no price
/// within the tolerance, or whose base price is unusable, yields `expired`.
pub fn evaluate_window(
    points: &[PricePoint],
    window: &EvaluationWindow,
    direction: TargetDirection,
    target_pct: f64,
) -> Evaluation {
    let (first, last) = match (points.first(), points.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Evaluation::expired(),
    };

    if !window.is_covered_by(first, last) {
        return Evaluation::expired();
    }

    let base = Price::new(first.price);
    if !base.is_valid_base() {
        return Evaluation::expired();
    }

    let change = |p: &PricePoint| Percent::change(base, Price::new(p.price)).as_f64();

    let mut highest = (f64::NEG_INFINITY, first.timestamp);
    let mut lowest = (f64::INFINITY, first.timestamp);
    for point in points {
        let pct = change(point);
        if pct > highest.0 {
            highest = (pct, point.timestamp);
        }
        if pct < lowest.0 {
            lowest = (pct, point.timestamp);
        }
    }

    let actual = change(last);
    let result = if direction.is_met(actual, target_pct) {
        EvaluationResult::Success
    } else {
        EvaluationResult::Failed
    };
    let ath_timestamp = match direction {
        TargetDirection::Up => highest.1,
        TargetDirection::Down => lowest.1,
    };

    Evaluation {
        result,
        actual_price_change_pct: Some(actual),
        ath_highest_pct: Some(highest.0),
        ath_lowest_pct: Some(lowest.0),
        ath_timestamp: Some(ath_timestamp),
    }
}

/// What a sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub success: usize,
    pub failed: usize,
    pub expired: usize,
    pub retrying: usize,
    pub released_stale: u64,
}

impl SweepReport {
    fn count(&mut self, result: EvaluationResult) {
        match result {
            EvaluationResult::Success => self.success += 1,
            EvaluationResult::Failed => self.failed += 1,
            EvaluationResult::Expired => self.expired += 1,
        }
    }
}

/// What happened to a single claimed prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Finalized(EvaluationResult),
    /// Claim released for a later retry
    Retrying,
    /// The prediction disappeared (logs were reset) or the claim was lost
    Skipped,
}

pub struct EvaluationScheduler {
    store: Arc<dyn PredictionStore>,
    prices: Arc<dyn PriceSource>,
    config: EvaluationConfig,
}

impl EvaluationScheduler {
    pub fn new(store: Arc<dyn PredictionStore>, prices: Arc<dyn PriceSource>, config: EvaluationConfig) -> Self {
        Self { store, prices, config }
    }

    /// Return claims orphaned by a crashed worker to `active`
    pub async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - ChronoDuration::seconds(self.config.claim_timeout_secs as i64);
        let released = self.store.release_stale_claims(cutoff).await?;
        if released > 0 {
            warn!("Released {} stale evaluation claims", released);
        }
        Ok(released)
    }

    /// Claim and evaluate every due prediction.
    ///
    /// Claims are taken under a token private to this sweep. Each claim is
    /// renewed right before its prediction is evaluated, and every write
    /// back requires the token, so a claim reclaimed as stale while this
    /// sweep was busy is never written twice.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport {
            released_stale: self.release_stale_claims(now).await?,
            ..Default::default()
        };

        let token = rand::random::<i64>();
        let claimed = self.store.claim_due(now, self.config.claim_limit, token).await?;
        report.claimed = claimed.len();

        for prediction_id in claimed {
            // sweep time advances with the wall clock so renewals stay fresh
            let at = now + ChronoDuration::from_std(started.elapsed()).unwrap_or_else(|_| ChronoDuration::zero());
            match self.store.renew_claim(prediction_id, token, at).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Claim on prediction {} was taken over, skipping it", prediction_id);
                    continue;
                }
                Err(e) => warn!("Could not renew claim on prediction {}: {}", prediction_id, e),
            }

            match self.evaluate_claimed(prediction_id, token, at).await {
                ClaimOutcome::Finalized(result) => report.count(result),
                ClaimOutcome::Retrying => report.retrying += 1,
                ClaimOutcome::Skipped => {}
            }
        }

        if report.claimed > 0 {
            info!(
                "Evaluated {} predictions: {} success, {} failed, {} expired, {} retrying",
                report.claimed, report.success, report.failed, report.expired, report.retrying
            );
        }
        Ok(report)
    }

    /// Evaluate a prediction held in `evaluating` under `token`.
    /// Never returns an error: every failure ends in a retry or a terminal state.
    pub async fn evaluate_claimed(&self, prediction_id: i64, token: i64, now: DateTime<Utc>) -> ClaimOutcome {
        let prediction = match self.store.get_prediction(prediction_id).await {
            Ok(p) => p,
            Err(Error::PredictionNotFound(_)) => return ClaimOutcome::Skipped,
            Err(e) if e.is_transient() => {
                warn!("Could not load prediction {}: {}", prediction_id, e);
                return self.release(prediction_id, token, 1, now).await;
            }
            Err(e) => {
                error!("Prediction {} is unreadable, expiring it: {}", prediction_id, e);
                return self.finish(prediction_id, token, Evaluation::expired(), now).await;
            }
        };

        match self.fetch_window(&prediction).await {
            Ok(points) => {
                let window = EvaluationWindow::for_prediction(&prediction, self.config.coverage_tolerance());
                let evaluation = evaluate_window(
                    &points,
                    &window,
                    prediction.target_direction,
                    prediction.price_change_percent,
                );
                if evaluation.result == EvaluationResult::Expired {
                    debug!(
                        "Prediction {} expired: {} prices for {} do not cover the window",
                        prediction.id,
                        points.len(),
                        prediction.coin_id
                    );
                }
                self.finish(prediction.id, token, evaluation, now).await
            }
            Err(e) if e.is_transient() => {
                let attempts = prediction.evaluation_attempts + 1;
                let stale = now - prediction.evaluation_timestamp
                    > ChronoDuration::seconds(self.config.max_staleness_secs as i64);

                if attempts >= self.config.max_attempts || stale {
                    warn!(
                        "Giving up on prediction {} after {} attempts: {}",
                        prediction.id, attempts, e
                    );
                    self.finish(prediction.id, token, Evaluation::expired(), now).await
                } else {
                    warn!("Price fetch for prediction {} failed (attempt {}): {}", prediction.id, attempts, e);
                    self.release(prediction.id, token, attempts, now).await
                }
            }
            Err(e) => {
                error!("Prediction {} cannot be evaluated, expiring it: {}", prediction.id, e);
                self.finish(prediction.id, token, Evaluation::expired(), now).await
            }
        }
    }

    async fn fetch_window(&self, prediction: &Prediction) -> Result<Vec<PricePoint>> {
        let fetch = self.prices.price_series(
            &prediction.coin_id,
            prediction.prediction_timestamp,
            prediction.evaluation_timestamp,
        );

        tokio::time::timeout(self.config.fetch_timeout(), fetch)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "price series for {} after {}ms",
                    prediction.coin_id, self.config.fetch_timeout_ms
                ))
            })?
    }

    async fn release(&self, prediction_id: i64, token: i64, attempts: u32, now: DateTime<Utc>) -> ClaimOutcome {
        let delay = backoff_delay(
            self.config.retry_base_delay_ms,
            self.config.max_staleness_secs.saturating_mul(1000),
            attempts,
        );
        let retry_at = now + ChronoDuration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);

        match self.store.release_claim(prediction_id, token, retry_at).await {
            Ok(()) => ClaimOutcome::Retrying,
            Err(e) => {
                // the stale-claim sweep picks it up later
                error!("Could not release claim on prediction {}: {}", prediction_id, e);
                ClaimOutcome::Skipped
            }
        }
    }

    async fn finish(&self, prediction_id: i64, token: i64, evaluation: Evaluation, now: DateTime<Utc>) -> ClaimOutcome {
        match self.store.finalize(prediction_id, token, &evaluation, now).await {
            Ok(true) => ClaimOutcome::Finalized(evaluation.result),
            Ok(false) => {
                warn!("Lost claim on prediction {} before it was finalized", prediction_id);
                ClaimOutcome::Skipped
            }
            Err(e) => {
                error!("Could not finalize prediction {}: {}", prediction_id, e);
                ClaimOutcome::Skipped
            }
        }
    }
}

/// Spawn `config.workers` evaluation workers sharing one scheduler
pub fn spawn_evaluation_workers(
    scheduler: Arc<EvaluationScheduler>,
    cancel_token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let workers = scheduler.config.workers;
    let interval = Duration::from_secs(scheduler.config.interval_secs.max(1));

    (0..workers)
        .map(|worker| {
            let scheduler = scheduler.clone();
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                info!("Evaluation worker {} started (interval: {}s)", worker, interval.as_secs());
                loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            info!("Evaluation worker {} cancelled, exiting", worker);
                            break;
                        }
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = scheduler.run_sweep(Utc::now()).await {
                                error!("Evaluation worker {} sweep failed: {}", worker, e);
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(minutes)
    }

    fn series(prices: &[(i64, f64)]) -> Vec<PricePoint> {
        prices.iter().map(|&(m, p)| PricePoint::new(t(m), p)).collect()
    }

    /// Minutes 0..=10 with a one minute tolerance
    fn ten_minutes() -> EvaluationWindow {
        EvaluationWindow::new(t(0), t(10), ChronoDuration::minutes(1))
    }

    #[test]
    fn test_up_target_met() {
        let points = series(&[(0, 100.0), (4, 103.0), (10, 106.0)]);
        let eval = evaluate_window(&points, &ten_minutes(), TargetDirection::Up, 5.0);

        assert_eq!(eval.result, EvaluationResult::Success);
        assert!((eval.actual_price_change_pct.unwrap() - 6.0).abs() < 1e-9);
        assert_eq!(eval.ath_timestamp, Some(t(10)));
    }

    #[test]
    fn test_up_target_missed_records_excursions() {
        let points = series(&[(0, 100.0), (3, 108.0), (6, 95.0), (10, 102.0)]);
        let eval = evaluate_window(&points, &ten_minutes(), TargetDirection::Up, 5.0);

        assert_eq!(eval.result, EvaluationResult::Failed);
        assert!((eval.ath_highest_pct.unwrap() - 8.0).abs() < 1e-9);
        assert!((eval.ath_lowest_pct.unwrap() + 5.0).abs() < 1e-9);
        assert_eq!(eval.ath_timestamp, Some(t(3)));
    }

    #[test]
    fn test_down_target_uses_lowest_point() {
        let points = series(&[(0, 100.0), (2, 104.0), (7, 90.0), (10, 93.0)]);
        let eval = evaluate_window(&points, &ten_minutes(), TargetDirection::Down, 5.0);

        assert_eq!(eval.result, EvaluationResult::Success);
        assert_eq!(eval.ath_timestamp, Some(t(7)));
    }

    #[test]
    fn test_no_data_is_expired_not_failed() {
        assert_eq!(
            evaluate_window(&[], &ten_minutes(), TargetDirection::Up, 5.0).result,
            EvaluationResult::Expired
        );
        let zero_base = series(&[(0, 0.0), (10, 50.0)]);
        assert_eq!(
            evaluate_window(&zero_base, &ten_minutes(), TargetDirection::Up, 5.0).result,
            EvaluationResult::Expired
        );
    }

    #[test]
    fn test_single_point_at_start_is_expired() {
        let eval = evaluate_window(&series(&[(0, 100.0)]), &ten_minutes(), TargetDirection::Up, 5.0);
        assert_eq!(eval, Evaluation::expired());
    }

    #[test]
    fn test_partial_window_is_expired_not_failed() {
        // the feed stopped halfway through
        let head_only = series(&[(0, 100.0), (3, 101.0), (5, 102.0)]);
        assert_eq!(
            evaluate_window(&head_only, &ten_minutes(), TargetDirection::Up, 5.0).result,
            EvaluationResult::Expired
        );

        // the feed started late, so there is no base price
        let tail_only = series(&[(6, 100.0), (10, 90.0)]);
        assert_eq!(
            evaluate_window(&tail_only, &ten_minutes(), TargetDirection::Down, 5.0).result,
            EvaluationResult::Expired
        );
    }

    #[test]
    fn test_points_within_tolerance_cover_the_window() {
        let window = EvaluationWindow::new(t(0), t(10), ChronoDuration::seconds(90));
        let points = series(&[(1, 100.0), (9, 94.0)]);
        let eval = evaluate_window(&points, &window, TargetDirection::Up, 5.0);

        assert_eq!(eval.result, EvaluationResult::Failed);
        assert!((eval.actual_price_change_pct.unwrap() + 6.0).abs() < 1e-9);
    }
}
