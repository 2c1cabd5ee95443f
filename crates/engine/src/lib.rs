//! Coin Alert Engine - Tick ingestion, classification, batching, evaluation
//! and statistics

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod evaluation;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod scorer;
pub mod service;
pub mod statistics;

pub use config::EngineConfig;
pub use engine::{Engine, EngineDeps, EngineHandle};
pub use evaluation::{evaluate_window, EvaluationScheduler, EvaluationWindow};
pub use ingest::TickPushHandle;
pub use scorer::{PrecomputedScorer, Scorer};
pub use service::{AlertService, PredictOutcome, PredictRequest};
