// crates/sg-manager/src/lib.rs
//! Manager façade over the auth-and-spend pipeline.
//!
//! The proxy talks to one [`Manager`] value. The enabled variant wires
//! cache, pool, authenticator, and spend logger together and enforces
//! lifecycle ordering; the disabled variant answers every call inertly so
//! deployments without a catalog run the same code path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use sg_auth::{Authenticator, CacheStats, TokenCache};
use sg_config::DataPlaneConfig;
use sg_db::{ConnectionStats, DbPool};
use sg_spend::{SpendLogger, SpendLoggerStats};
use sg_types::{GateError, SpendLogEntry, TokenInfo};

pub use sg_auth::{hash_token, mask_token};
pub use sg_config::DataPlaneConfig as Config;
pub use sg_db::mask_database_url;
pub use sg_types::{BudgetLevel, GateError as Error};

struct Enabled {
    pool: Arc<DbPool>,
    cache: Arc<TokenCache>,
    authenticator: Authenticator,
    logger: SpendLogger,
}

/// Entry point for per-request authentication and spend accounting.
pub struct Manager {
    inner: Option<Enabled>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

impl Manager {
    /// A manager that is wired to nothing: authentication calls return
    /// [`GateError::ModuleDisabled`], spend logging succeeds as a no-op,
    /// and every stats call returns empty defaults.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            stopped: AtomicBool::new(false),
        }
    }

    /// Connect using `SG_DATABASE_URL` and the other `SG_*` environment
    /// overrides.
    pub async fn from_env() -> Result<Self, GateError> {
        let cfg = DataPlaneConfig::from_env()
            .map_err(|e| GateError::ConnectionFailed(e.to_string()))?;
        Self::connect(&cfg).await
    }

    /// Build the enabled pipeline: pool, then cache, authenticator, and
    /// spend logger, starting the logger workers last. A failure after the
    /// pool exists closes it before returning.
    pub async fn connect(cfg: &DataPlaneConfig) -> Result<Self, GateError> {
        cfg.validate()
            .map_err(|e| GateError::ConnectionFailed(e.to_string()))?;

        let pool = DbPool::connect(cfg).await?;

        let enabled = match Self::assemble(Arc::clone(&pool), cfg) {
            Ok(enabled) => enabled,
            Err(err) => {
                pool.close().await;
                return Err(err);
            }
        };

        enabled.logger.start();
        info!("auth-and-spend pipeline started");

        Ok(Self {
            inner: Some(enabled),
            stopped: AtomicBool::new(false),
        })
    }

    fn assemble(pool: Arc<DbPool>, cfg: &DataPlaneConfig) -> Result<Enabled, GateError> {
        let cache = Arc::new(TokenCache::new(cfg.auth_cache_size, cfg.auth_cache_ttl_secs));
        let authenticator = Authenticator::new(Arc::clone(&pool), Arc::clone(&cache));
        let logger = SpendLogger::new(Arc::clone(&pool), cfg);
        Ok(Enabled {
            pool,
            cache,
            authenticator,
            logger,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Pool health as seen by the read path. Disabled managers are never
    /// healthy.
    pub fn is_healthy(&self) -> bool {
        match &self.inner {
            Some(enabled) => enabled.pool.is_healthy(),
            None => false,
        }
    }

    pub async fn validate_token(&self, raw: &str) -> Result<Arc<TokenInfo>, GateError> {
        match &self.inner {
            Some(enabled) => enabled.authenticator.validate_token(raw).await,
            None => Err(GateError::ModuleDisabled),
        }
    }

    pub async fn validate_token_for_model(
        &self,
        raw: &str,
        model: &str,
    ) -> Result<Arc<TokenInfo>, GateError> {
        match &self.inner {
            Some(enabled) => {
                enabled
                    .authenticator
                    .validate_token_for_model(raw, model)
                    .await
            }
            None => Err(GateError::ModuleDisabled),
        }
    }

    /// Queue one spend record. On a disabled manager this is a successful
    /// no-op so callers need no special casing.
    pub async fn log_spend(&self, entry: SpendLogEntry) -> Result<(), GateError> {
        match &self.inner {
            Some(enabled) => enabled.logger.log(entry).await,
            None => Ok(()),
        }
    }

    /// Drop one cached token snapshot (e.g. after a key update).
    pub fn invalidate_token(&self, token_hash: &str) {
        if let Some(enabled) = &self.inner {
            enabled.cache.invalidate(token_hash);
        }
    }

    pub fn auth_cache_stats(&self) -> CacheStats {
        match &self.inner {
            Some(enabled) => enabled.cache.stats(),
            None => CacheStats::default(),
        }
    }

    pub fn spend_logger_stats(&self) -> SpendLoggerStats {
        match &self.inner {
            Some(enabled) => enabled.logger.stats(),
            None => SpendLoggerStats::default(),
        }
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        match &self.inner {
            Some(enabled) => enabled.pool.stats(),
            None => ConnectionStats::default(),
        }
    }

    /// Stop the pipeline leaves-first: the logger drains its queue and dead
    /// letters, then the pool cancels its background work and closes.
    /// Tolerates repeat calls.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(enabled) = &self.inner {
            enabled.logger.shutdown(deadline).await;
            enabled.pool.close().await;
            info!("auth-and-spend pipeline stopped");
        }
    }
}
