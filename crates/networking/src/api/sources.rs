//! `PriceSource` and `TickPoller` backed by the metrics service

use crate::MetricsClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coinalert_core::{PricePoint, PriceSource, Result, Tick, TickPage, TickPoller};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Response of `GET /coins/{coin}/prices`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSeriesResponse {
    pub coin_id: String,
    #[serde(default)]
    pub points: Vec<PricePoint>,
}

/// Response of `GET /ticks`.
///
/// Items are decoded one by one so a single malformed tick cannot fail the
/// whole page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicksResponse {
    #[serde(default)]
    pub ticks: Vec<serde_json::Value>,
}

impl TicksResponse {
    /// Ticks with `id > after_id`, ordered by id, at most `limit` rows.
    /// Malformed items that still carry an id are counted as skipped rows;
    /// items without one are dropped.
    pub fn into_page(self, after_id: i64, limit: u32) -> TickPage {
        let mut rows: Vec<(i64, Option<Tick>)> = Vec::with_capacity(self.ticks.len());
        for item in self.ticks {
            let id = item.get("id").and_then(serde_json::Value::as_i64);
            match serde_json::from_value::<Tick>(item) {
                Ok(tick) => rows.push((tick.id, Some(tick))),
                Err(e) => match id {
                    Some(id) => {
                        warn!("Skipping malformed tick {}: {}", id, e);
                        rows.push((id, None));
                    }
                    None => warn!("Dropping tick without an id: {}", e),
                },
            }
        }

        rows.retain(|(id, _)| *id > after_id);
        rows.sort_by_key(|(id, _)| *id);
        rows.truncate(limit as usize);

        let mut page = TickPage {
            last_id: rows.last().map(|(id, _)| *id),
            ..TickPage::default()
        };
        for (_, tick) in rows {
            match tick {
                Some(tick) => page.ticks.push(tick),
                None => page.skipped += 1,
            }
        }
        page
    }
}

/// Keep finite prices inside `[from, to]`, ordered by time
pub fn clean_series(mut points: Vec<PricePoint>, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<PricePoint> {
    let before = points.len();
    points.retain(|p| p.price.is_finite() && p.timestamp >= from && p.timestamp <= to);
    if points.len() != before {
        warn!("Dropped {} unusable price points", before - points.len());
    }
    points.sort_by_key(|p| p.timestamp);
    points
}

#[async_trait]
impl PriceSource for MetricsClient {
    async fn price_series(
        &self,
        coin_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>> {
        let response = self.get_price_series(coin_id, from, to).await?;
        Ok(clean_series(response.points, from, to))
    }
}

#[async_trait]
impl TickPoller for MetricsClient {
    async fn poll_ticks(&self, after_id: i64, limit: u32) -> Result<TickPage> {
        Ok(self.get_ticks(after_id, limit).await?.into_page(after_id, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_clean_series_orders_and_filters() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let points = vec![
            PricePoint::new(start + Duration::minutes(5), 110.0),
            PricePoint::new(start, 100.0),
            PricePoint::new(start + Duration::minutes(3), f64::NAN),
            PricePoint::new(start + Duration::minutes(20), 130.0),
        ];

        let cleaned = clean_series(points, start, start + Duration::minutes(10));
        let prices: Vec<f64> = cleaned.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![100.0, 110.0]);
    }

    #[test]
    fn test_price_response_parses() {
        let response: PriceSeriesResponse = serde_json::from_str(
            r#"{"coin_id": "BTC", "points": [{"timestamp": "2024-05-01T12:00:00Z", "price": 100.5}]}"#,
        )
        .unwrap();
        assert_eq!(response.points.len(), 1);
        assert_eq!(response.points[0].price, 100.5);
    }

    #[test]
    fn test_malformed_tick_is_skipped_not_fatal() {
        let response: TicksResponse = serde_json::from_str(
            r#"{"ticks": [
                {"id": 12, "coin_id": "ETH", "timestamp": "2024-05-01T12:00:05Z"},
                {"id": 11, "coin_id": "BTC", "timestamp": "not a time"},
                {"coin_id": "???"},
                {"id": 9, "coin_id": "OLD", "timestamp": "2024-05-01T11:00:00Z"}
            ]}"#,
        )
        .unwrap();

        let page = response.into_page(10, 50);
        assert_eq!(page.ticks.len(), 1);
        assert_eq!(page.ticks[0].coin_id, "ETH");
        assert_eq!(page.skipped, 1);
        assert_eq!(page.last_id, Some(12));
    }

    #[test]
    fn test_page_of_only_malformed_ticks_still_advances() {
        let response: TicksResponse = serde_json::from_str(
            r#"{"ticks": [{"id": 4, "coin_id": 1}, {"id": 5, "scores": "x"}]}"#,
        )
        .unwrap();

        let page = response.into_page(3, 2);
        assert!(page.ticks.is_empty());
        assert_eq!(page.rows(), 2);
        assert_eq!(page.last_id, Some(5));
    }
}
