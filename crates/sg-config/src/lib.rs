// crates/sg-config/src/lib.rs
//! Data-plane configuration.
//!
//! # Contract
//! - Config YAML (or programmatic construction) provides every knob with a
//!   serde default; only `database_url` is mandatory.
//! - `SG_*` environment variables overlay the loaded values; `from_env`
//!   bootstraps `.env` files via dotenvy for dev runs.
//! - Error messages reference option names, never secret values. The DSN
//!   itself is only ever logged through `sg_db::mask_database_url`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_DATABASE_URL: &str = "SG_DATABASE_URL";

/// Every tunable of the auth-and-spend pipeline.
///
/// | Option | Default | Semantics |
/// |---|---|---|
/// | `database_url` | (required) | PostgreSQL DSN |
/// | `max_conns` / `min_conns` | 10 / 2 | pool bounds; min capped to max |
/// | `connect_timeout_secs` | 5 | initial and reconnect ping budget |
/// | `health_check_interval_secs` | 10 | pool self-check cadence |
/// | `auth_cache_size` | 10 000 | token cache capacity |
/// | `auth_cache_ttl_secs` | 60 | token cache per-entry TTL |
/// | `log_queue_size` | 10 000 | spend log queue depth |
/// | `log_batch_size` | 100 | flush threshold by count |
/// | `log_flush_interval_secs` | 5 | flush threshold by time |
/// | `log_retry_attempts` | 3 | reserved for callers |
/// | `log_retry_delay_secs` | 1 | reserved for callers |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataPlaneConfig {
    #[serde(default)]
    pub database_url: String,

    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
    #[serde(default = "default_min_conns")]
    pub min_conns: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Token cache capacity. Non-positive values fall back to the default
    /// inside the cache itself.
    #[serde(default = "default_auth_cache_size")]
    pub auth_cache_size: i64,
    /// Token cache TTL in seconds. Non-positive values fall back to a 5 s
    /// TTL inside the cache itself.
    #[serde(default = "default_auth_cache_ttl_secs")]
    pub auth_cache_ttl_secs: i64,

    #[serde(default = "default_log_queue_size")]
    pub log_queue_size: usize,
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: usize,
    #[serde(default = "default_log_flush_interval_secs")]
    pub log_flush_interval_secs: u64,
    #[serde(default = "default_log_retry_attempts")]
    pub log_retry_attempts: u32,
    #[serde(default = "default_log_retry_delay_secs")]
    pub log_retry_delay_secs: u64,
}

fn default_max_conns() -> u32 {
    10
}
fn default_min_conns() -> u32 {
    2
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_health_check_interval_secs() -> u64 {
    10
}
fn default_auth_cache_size() -> i64 {
    10_000
}
fn default_auth_cache_ttl_secs() -> i64 {
    60
}
fn default_log_queue_size() -> usize {
    10_000
}
fn default_log_batch_size() -> usize {
    100
}
fn default_log_flush_interval_secs() -> u64 {
    5
}
fn default_log_retry_attempts() -> u32 {
    3
}
fn default_log_retry_delay_secs() -> u64 {
    1
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_conns: default_max_conns(),
            min_conns: default_min_conns(),
            connect_timeout_secs: default_connect_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            auth_cache_size: default_auth_cache_size(),
            auth_cache_ttl_secs: default_auth_cache_ttl_secs(),
            log_queue_size: default_log_queue_size(),
            log_batch_size: default_log_batch_size(),
            log_flush_interval_secs: default_log_flush_interval_secs(),
            log_retry_attempts: default_log_retry_attempts(),
            log_retry_delay_secs: default_log_retry_delay_secs(),
        }
    }
}

impl DataPlaneConfig {
    /// Build a config with defaults and the given DSN.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Parse a YAML document into a config. Unknown keys are rejected.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse data-plane config YAML")
    }

    /// Build a config from defaults plus `SG_*` environment overrides.
    ///
    /// Loads `.env` first (ignored when absent) so dev shells pick up local
    /// overrides the same way the rest of the tooling does.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Overlay any `SG_*` variables present in the environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_nonempty(ENV_DATABASE_URL) {
            self.database_url = v;
        }
        overlay(&mut self.max_conns, "SG_DB_MAX_CONNS")?;
        overlay(&mut self.min_conns, "SG_DB_MIN_CONNS")?;
        overlay(&mut self.connect_timeout_secs, "SG_DB_CONNECT_TIMEOUT_SECS")?;
        overlay(
            &mut self.health_check_interval_secs,
            "SG_DB_HEALTH_CHECK_INTERVAL_SECS",
        )?;
        overlay(&mut self.auth_cache_size, "SG_AUTH_CACHE_SIZE")?;
        overlay(&mut self.auth_cache_ttl_secs, "SG_AUTH_CACHE_TTL_SECS")?;
        overlay(&mut self.log_queue_size, "SG_LOG_QUEUE_SIZE")?;
        overlay(&mut self.log_batch_size, "SG_LOG_BATCH_SIZE")?;
        overlay(
            &mut self.log_flush_interval_secs,
            "SG_LOG_FLUSH_INTERVAL_SECS",
        )?;
        overlay(&mut self.log_retry_attempts, "SG_LOG_RETRY_ATTEMPTS")?;
        overlay(&mut self.log_retry_delay_secs, "SG_LOG_RETRY_DELAY_SECS")?;
        Ok(())
    }

    /// Validate mandatory options. The DSN value never appears in the error.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!(
                "database_url is required (set it in config or via {})",
                ENV_DATABASE_URL
            );
        }
        if self.max_conns == 0 {
            bail!("max_conns must be at least 1");
        }
        if self.log_batch_size == 0 {
            bail!("log_batch_size must be at least 1");
        }
        if self.log_queue_size == 0 {
            bail!("log_queue_size must be at least 1");
        }
        Ok(())
    }

    /// Pool minimum, capped to the maximum.
    pub fn effective_min_conns(&self) -> u32 {
        self.min_conns.min(self.max_conns)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_secs(self.log_flush_interval_secs)
    }

    pub fn log_retry_delay(&self) -> Duration {
        Duration::from_secs(self.log_retry_delay_secs)
    }
}

/// Read a non-empty env var, trimming whitespace.
fn env_nonempty(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// Parse an env var into `slot` when present; error names the variable.
fn overlay<T: std::str::FromStr>(slot: &mut T, name: &str) -> Result<()>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = env_nonempty(name) {
        *slot = raw
            .parse::<T>()
            .with_context(|| format!("invalid value for env var {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let cfg = DataPlaneConfig::default();
        assert_eq!(cfg.max_conns, 10);
        assert_eq!(cfg.min_conns, 2);
        assert_eq!(cfg.connect_timeout_secs, 5);
        assert_eq!(cfg.health_check_interval_secs, 10);
        assert_eq!(cfg.auth_cache_size, 10_000);
        assert_eq!(cfg.auth_cache_ttl_secs, 60);
        assert_eq!(cfg.log_queue_size, 10_000);
        assert_eq!(cfg.log_batch_size, 100);
        assert_eq!(cfg.log_flush_interval_secs, 5);
        assert_eq!(cfg.log_retry_attempts, 3);
        assert_eq!(cfg.log_retry_delay_secs, 1);
    }

    #[test]
    fn validate_requires_database_url() {
        let cfg = DataPlaneConfig::default();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("database_url"));
        assert!(err.contains(ENV_DATABASE_URL));

        let cfg = DataPlaneConfig::with_database_url("postgres://sg:pw@localhost/llm");
        cfg.validate().unwrap();
    }

    #[test]
    fn min_conns_capped_to_max() {
        let mut cfg = DataPlaneConfig::with_database_url("postgres://x");
        cfg.max_conns = 4;
        cfg.min_conns = 9;
        assert_eq!(cfg.effective_min_conns(), 4);
    }

    #[test]
    fn yaml_round_trip_with_defaults() {
        let cfg = DataPlaneConfig::from_yaml(
            "database_url: postgres://sg:pw@db:5432/router\nlog_batch_size: 250\n",
        )
        .unwrap();
        assert_eq!(cfg.log_batch_size, 250);
        assert_eq!(cfg.auth_cache_size, 10_000);

        assert!(DataPlaneConfig::from_yaml("no_such_option: 1").is_err());
    }
}
