//! Data models for the alert engine

mod model;
mod prediction;
mod statistics;
mod tick;

pub use model::*;
pub use prediction::*;
pub use statistics::*;
pub use tick::*;
