use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::CoordinatorSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Directory holding `labelq-items.db` and `labelq-leases.db`.
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub lease_ttl: Duration,
    pub sweep_interval: Duration,
    pub claim_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = lookup("LABELQ_PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("LABELQ_PORT must be a valid port number")?;

        let state_dir = lookup("LABELQ_STATE_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let lease_ttl = Duration::from_secs(positive(&lookup, "LABELQ_LEASE_TTL_SECS", 900)?);
        let sweep_interval =
            Duration::from_secs(positive(&lookup, "LABELQ_SWEEP_INTERVAL_SECS", 60)?);
        let claim_attempts = u32::try_from(positive(&lookup, "LABELQ_CLAIM_ATTEMPTS", 3)?)
            .context("LABELQ_CLAIM_ATTEMPTS is too large")?;

        Ok(Config {
            port,
            state_dir,
            lease_ttl,
            sweep_interval,
            claim_attempts,
        })
    }

    pub fn items_db_path(&self) -> PathBuf {
        self.state_dir.join("labelq-items.db")
    }

    pub fn leases_db_path(&self) -> PathBuf {
        self.state_dir.join("labelq-leases.db")
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            lease_ttl: self.lease_ttl,
            claim_attempts: self.claim_attempts,
        }
    }
}

fn positive<F>(lookup: &F, name: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} must be a whole number", name))?,
        None => default,
    };
    if value == 0 {
        bail!("{} must be greater than zero", name);
    }
    Ok(value)
}
