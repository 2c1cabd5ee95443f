//! HTTP client for the coin-metrics service

use crate::api::{PriceSeriesResponse, TicksResponse};
use chrono::{DateTime, Utc};
use coinalert_core::{Error, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION},
    Client, Response,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, instrument};

const USER_AGENT_VALUE: &str = concat!("coinalert/", env!("CARGO_PKG_VERSION"));

/// Client for the service that stores raw coin metrics.
///
/// Every request carries the configured timeout, so a hung upstream turns
/// into `Error::Timeout` instead of stalling an evaluation worker.
#[derive(Clone)]
pub struct MetricsClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl MetricsClient {
    /// Create a client for `base_url` (e.g. `http://metrics:8080/api`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT_VALUE)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::NetworkError(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    /// Send `Authorization: Bearer <key>` with every request
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| Error::InvalidConfig(format!("api key: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }

    /// Map HTTP failures onto the error taxonomy and decode the body
    async fn parse_response<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            error!("{} request failed: HTTP {} {}", what, status, body);
            return Err(Error::ApiError(format!("HTTP {}: {}", status, body)));
        }

        response.json().await.map_err(|e| {
            error!("Failed to parse {} response: {}", what, e);
            Error::InvalidData(e.to_string())
        })
    }

    /// Fetch the raw price series of a coin between two instants
    #[instrument(skip(self))]
    pub async fn get_price_series(
        &self,
        coin_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PriceSeriesResponse> {
        let url = format!("{}/coins/{}/prices", self.base_url, coin_id);
        debug!("Fetching prices from: {}", url);

        let response = self
            .http
            .get(&url)
            .headers(self.default_headers()?)
            .query(&[("from", from.to_rfc3339()), ("to", to.to_rfc3339())])
            .send()
            .await?;

        Self::parse_response(response, "price series").await
    }

    /// Fetch ticks newer than `after_id`
    #[instrument(skip(self))]
    pub async fn get_ticks(&self, after_id: i64, limit: u32) -> Result<TicksResponse> {
        let url = format!("{}/ticks", self.base_url);

        let response = self
            .http
            .get(&url)
            .headers(self.default_headers()?)
            .query(&[("after_id", after_id.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;

        Self::parse_response(response, "ticks").await
    }
}
