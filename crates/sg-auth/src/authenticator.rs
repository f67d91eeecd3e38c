//! Read path: hash → cache → catalog → validate → cache.

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, warn};

use sg_db::{queries, DbPool};
use sg_types::{GateError, TokenInfo};

use crate::cache::TokenCache;
use crate::token::{hash_token, mask_token};
use crate::validate::validate_token_info;

/// Per-request token authentication against the catalog, fronted by the
/// token cache.
pub struct Authenticator {
    pool: Arc<DbPool>,
    cache: Arc<TokenCache>,
}

impl Authenticator {
    pub fn new(pool: Arc<DbPool>, cache: Arc<TokenCache>) -> Self {
        Self { pool, cache }
    }

    /// Validate a raw client token with no model restriction.
    pub async fn validate_token(&self, raw: &str) -> Result<Arc<TokenInfo>, GateError> {
        self.validate_token_for_model(raw, "").await
    }

    /// Validate a raw client token and, when `model` is non-empty, its
    /// model allow-list.
    pub async fn validate_token_for_model(
        &self,
        raw: &str,
        model: &str,
    ) -> Result<Arc<TokenInfo>, GateError> {
        if raw.is_empty() {
            return Err(GateError::TokenNotFound);
        }
        let hash = hash_token(raw);

        if let Some(info) = self.cache.get(&hash) {
            // Never skip revalidation on a hit: budgets and expiry may have
            // crossed a threshold since the snapshot was cached.
            validate_token_info(&info, model)?;
            debug!(token = %mask_token(&hash), "token validated from cache");
            return Ok(info);
        }

        if !self.pool.is_healthy() {
            return Err(GateError::ConnectionFailed(
                "connection pool is unhealthy".to_string(),
            ));
        }

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(queries::SELECT_TOKEN_HIERARCHY)
            .bind(&hash)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                warn!(
                    token = %mask_token(&hash),
                    error = %e,
                    "token hierarchy lookup failed"
                );
                GateError::connection(e)
            })?;

        let Some(row) = row else {
            return Err(GateError::TokenNotFound);
        };

        let info = token_info_from_row(&row).map_err(|e| {
            warn!(token = %mask_token(&hash), error = %e, "token row decode failed");
            GateError::connection(e)
        })?;
        let info = Arc::new(info);

        // Invalid snapshots are surfaced but never cached; the next attempt
        // re-reads the catalog.
        validate_token_info(&info, model)?;

        self.cache.set(hash, Arc::clone(&info));
        Ok(info)
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }
}

/// Map the 35-column hierarchy row onto a snapshot. Nullable columns land
/// in options; a NULL `models` array means "all models".
fn token_info_from_row(row: &PgRow) -> anyhow::Result<TokenInfo> {
    Ok(TokenInfo {
        token_hash: row.try_get("token_hash")?,
        key_name: row.try_get("key_name")?,
        key_alias: row.try_get("key_alias")?,
        user_id: row.try_get("user_id")?,
        team_id: row.try_get("team_id")?,
        organization_id: row.try_get("organization_id")?,

        spend: row.try_get::<Option<f64>, _>("spend")?.unwrap_or(0.0),
        max_budget: row.try_get("max_budget")?,
        tpm_limit: row.try_get("tpm_limit")?,
        rpm_limit: row.try_get("rpm_limit")?,
        expires_at: row.try_get("expires_at")?,
        blocked: row.try_get::<Option<bool>, _>("blocked")?.unwrap_or(false),
        models: row
            .try_get::<Option<Vec<String>>, _>("models")?
            .unwrap_or_default(),

        user_max_budget: row.try_get("user_max_budget")?,
        user_spend: row.try_get("user_spend")?,
        user_alias: row.try_get("user_alias")?,
        user_email: row.try_get("user_email")?,

        team_max_budget: row.try_get("team_max_budget")?,
        team_spend: row.try_get("team_spend")?,
        team_blocked: row.try_get("team_blocked")?,
        team_tpm_limit: row.try_get("team_tpm_limit")?,
        team_rpm_limit: row.try_get("team_rpm_limit")?,
        team_alias: row.try_get("team_alias")?,

        org_spend: row.try_get("org_spend")?,
        org_max_budget: row.try_get("org_max_budget")?,
        org_tpm_limit: row.try_get("org_tpm_limit")?,
        org_rpm_limit: row.try_get("org_rpm_limit")?,

        team_member_spend: row.try_get("team_member_spend")?,
        team_member_max_budget: row.try_get("team_member_max_budget")?,
        team_member_tpm_limit: row.try_get("team_member_tpm_limit")?,
        team_member_rpm_limit: row.try_get("team_member_rpm_limit")?,

        org_member_spend: row.try_get("org_member_spend")?,
        org_member_max_budget: row.try_get("org_member_max_budget")?,
        org_member_tpm_limit: row.try_get("org_member_tpm_limit")?,
        org_member_rpm_limit: row.try_get("org_member_rpm_limit")?,
    })
}
