//! Raw HTTP access to the metrics service

mod client;

pub use client::*;
