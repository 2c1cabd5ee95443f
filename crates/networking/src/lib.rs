//! Coin Alert Networking - HTTP client for the coin-metrics service

pub mod api;
pub mod http;

pub use http::MetricsClient;
