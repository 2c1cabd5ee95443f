//! Coin Alert daemon - Main entry point

use anyhow::Context;
use coinalert_core::Tag;
use coinalert_engine::config::SETTINGS_KEY;
use coinalert_engine::{Engine, EngineConfig, EngineDeps};
use coinalert_persistence::{sqlite, Database};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "coinalert.toml";

/// Used when `RUST_LOG` is unset; names every crate of the workspace
const DEFAULT_LOG_FILTER: &str =
    "coinalert=info,coinalert_engine=info,coinalert_persistence=info,coinalert_networking=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COINALERT_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    tracing::info!("Starting Coin Alert (config: {})", config_path.display());

    let file_config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let db = Database::connect(&file_config.database_path)
        .await
        .with_context(|| format!("opening {}", file_config.database_path.display()))?;

    // settings stored in the database win over the file
    let config = match sqlite::get_setting::<serde_json::Value>(db.pool(), SETTINGS_KEY)
        .await
        .context("reading stored engine settings")?
    {
        Some(overrides) => {
            tracing::info!("Applying stored engine settings");
            file_config
                .with_overrides(&overrides)
                .context("applying stored engine settings")?
        }
        None => file_config,
    };

    let deps = EngineDeps::from_config(&config, db).context("building engine dependencies")?;
    let engine = Engine::start(config, deps).await.context("starting engine")?;

    let mut events = engine.subscribe();
    let alert_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(p) if p.tag == Tag::Alert => tracing::info!(
                    "ALERT model {} coin {} p={:.3} (evaluates at {})",
                    p.model_id,
                    p.coin_id,
                    p.probability,
                    p.evaluation_timestamp
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Alert log skipped {} predictions", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    engine.shutdown().await;
    alert_log.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_storage_and_network_warnings() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        for target in ["coinalert_persistence", "coinalert_networking", "coinalert_engine"] {
            assert!(
                DEFAULT_LOG_FILTER.split(',').any(|d| d == format!("{}=info", target)),
                "{} is filtered out",
                target
            );
        }
    }
}
