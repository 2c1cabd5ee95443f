//! Coin Alert Persistence - SQLite storage and the in-memory ignore cache

pub mod cache;
pub mod sqlite;

pub use cache::CoinIgnoreCache;
pub use sqlite::Database;
