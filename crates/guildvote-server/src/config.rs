use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use guildvote_core::{ReconcileConfig, StoreConfig};
use serde::Deserialize;

pub const DATABASE_URL_ENV: &str = "GUILDVOTE_DATABASE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub store: StoreSection,
    pub reconciliation: ReconciliationSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/guildvote.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub lock_wait_seconds: u64,
    pub cache_max_capacity: u64,
    pub cache_ttl_seconds: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            lock_wait_seconds: 10,
            cache_max_capacity: 1_000_000,
            cache_ttl_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationSection {
    pub update_interval_millis: u64,
    pub edit_sweep_interval_seconds: u64,
    pub expiry_sweep_interval_seconds: u64,
    pub update_timeout_minutes: u64,
    pub retry_pause_seconds: u64,
    pub gateway_timeout_seconds: u64,
    pub max_tries: u32,
    /// Days a poll is kept after it ended.
    pub delete_votes_offset_days: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for ReconciliationSection {
    fn default() -> Self {
        Self {
            update_interval_millis: 1_000,
            edit_sweep_interval_seconds: 10,
            expiry_sweep_interval_seconds: 10_800,
            update_timeout_minutes: 60,
            retry_pause_seconds: 30,
            gateway_timeout_seconds: 30,
            max_tries: 5,
            delete_votes_offset_days: 30,
            shutdown_grace_seconds: 60,
        }
    }
}

impl Config {
    /// Read the config file, falling back to defaults when it does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Self::parse(&contents).with_context(|| format!("invalid config file {path}"))?
        } else {
            tracing::warn!("Config file {path} not found, using defaults");
            Self::default()
        };

        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                config.database.url = url;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            bail!("database.url must not be empty");
        }
        if self.database.max_connections == 0 {
            bail!("database.max_connections must be at least 1");
        }
        if self.store.lock_wait_seconds == 0 {
            bail!("store.lock_wait_seconds must be at least 1");
        }
        if self.store.cache_ttl_seconds == 0 {
            bail!("store.cache_ttl_seconds must be positive");
        }

        let r = &self.reconciliation;
        if r.max_tries == 0 {
            bail!("reconciliation.max_tries must be at least 1");
        }
        for (name, value) in [
            ("update_interval_millis", r.update_interval_millis),
            ("edit_sweep_interval_seconds", r.edit_sweep_interval_seconds),
            ("expiry_sweep_interval_seconds", r.expiry_sweep_interval_seconds),
            ("update_timeout_minutes", r.update_timeout_minutes),
            ("retry_pause_seconds", r.retry_pause_seconds),
            ("gateway_timeout_seconds", r.gateway_timeout_seconds),
        ] {
            if value == 0 {
                bail!("reconciliation.{name} must be positive");
            }
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            lock_wait: Duration::from_secs(self.store.lock_wait_seconds),
            cache_max_capacity: self.store.cache_max_capacity,
            cache_ttl: Duration::from_secs(self.store.cache_ttl_seconds),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        let r = &self.reconciliation;
        ReconcileConfig {
            update_interval: Duration::from_millis(r.update_interval_millis),
            edit_sweep_interval: Duration::from_secs(r.edit_sweep_interval_seconds),
            expiry_sweep_interval: Duration::from_secs(r.expiry_sweep_interval_seconds),
            update_timeout: Duration::from_secs(r.update_timeout_minutes.saturating_mul(60)),
            retry_interval: Duration::from_secs(r.retry_pause_seconds),
            gateway_timeout: Duration::from_secs(r.gateway_timeout_seconds),
            max_tries: r.max_tries,
            retention: Duration::from_secs(r.delete_votes_offset_days.saturating_mul(24 * 60 * 60)),
            shutdown_grace: Duration::from_secs(r.shutdown_grace_seconds),
        }
    }
}
