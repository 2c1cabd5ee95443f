//! Metrics service payloads and the engine-facing data sources
//!
//! Wraps the raw HTTP client with cleanup of upstream data (ordering,
//! non-finite prices) before it reaches the engine.

mod sources;

pub use sources::*;
