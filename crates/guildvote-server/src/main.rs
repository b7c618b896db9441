use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use guildvote_core::{LogGateway, ReconciliationScheduler, TextRenderer, VoteStore};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("guildvote=info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = config::Config::load(&args.config)?;
    ensure_database_dir(&config.database.url);

    let pool = guildvote_db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    guildvote_db::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let store = Arc::new(VoteStore::new(pool, config.store_config()));
    let scheduler = Arc::new(ReconciliationScheduler::new(
        store,
        Arc::new(TextRenderer),
        Arc::new(LogGateway),
        config.reconcile_config(),
    ));

    for guild_id in &args.guilds {
        let restored = scheduler.on_scope_reachable(*guild_id).await?;
        tracing::info!(guild_id, restored, "restored pending refreshes");
    }
    scheduler.start();
    tracing::info!("guildvote running, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    let saved = scheduler.shutdown().await?;
    let stats = scheduler.stats();
    tracing::info!(
        saved,
        delivered = stats.delivered,
        exhausted = stats.exhausted,
        expired = stats.expired,
        "shutdown complete"
    );
    Ok(())
}

/// Create the parent directory of a file-backed SQLite database.
fn ensure_database_dir(url: &str) {
    if let Some(db_path) = url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
                }
            }
        }
    }
}
