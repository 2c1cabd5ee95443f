//! SQLite database management

mod coin_metrics;
mod connection;
mod models;
mod predictions;
mod settings;
mod store;
mod timestamps;

pub use coin_metrics::*;
pub use connection::Database;
pub use models::*;
pub use predictions::*;
pub use settings::*;
