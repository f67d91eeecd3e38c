//! Daily aggregation of committed spend logs.
//!
//! Two entry points share one pipeline. The push path folds the ids each
//! commit just inserted; it needs no cross-replica coordination because
//! every replica's inserted ids are disjoint. The safety-net path runs on
//! a ticker under a database advisory lock, sweeps every unprocessed row,
//! and is the only path that marks rows processed. Both dispatch the same
//! six dimensional aggregators, whose upserts sum into the daily tables
//! and are therefore safe to repeat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sg_db::{queries, DbPool};
use sg_types::GateError;

/// Safety-net sweep cadence.
pub const DEFAULT_SAFETY_NET_INTERVAL: Duration = Duration::from_secs(300);
/// Overall budget for one push-path aggregation.
const PUSH_AGGREGATION_BUDGET: Duration = Duration::from_secs(180);
/// Budget for each dimensional aggregator.
const DIMENSION_BUDGET: Duration = Duration::from_secs(30);

/// Shared aggregation bookkeeping, surfaced through the spend logger stats.
#[derive(Debug, Default)]
pub(crate) struct AggregationStats {
    count: AtomicU64,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl AggregationStats {
    pub(crate) fn record_run(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.last_run.write() = Some(Utc::now());
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read()
    }
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DimensionKind {
    User,
    Team,
    Organization,
    EndUser,
    Agent,
    Tag,
}

struct Dimension {
    name: &'static str,
    table: &'static str,
    id_column: &'static str,
    kind: DimensionKind,
}

const DIMENSIONS: [Dimension; 6] = [
    Dimension {
        name: "user",
        table: "LiteLLM_DailyUserSpend",
        id_column: "user_id",
        kind: DimensionKind::User,
    },
    Dimension {
        name: "team",
        table: "LiteLLM_DailyTeamSpend",
        id_column: "team_id",
        kind: DimensionKind::Team,
    },
    Dimension {
        name: "organization",
        table: "LiteLLM_DailyOrgSpend",
        id_column: "organization_id",
        kind: DimensionKind::Organization,
    },
    Dimension {
        name: "end_user",
        table: "LiteLLM_DailyEndUserSpend",
        id_column: "end_user_id",
        kind: DimensionKind::EndUser,
    },
    Dimension {
        name: "agent",
        table: "LiteLLM_DailyAgentSpend",
        id_column: "agent_id",
        kind: DimensionKind::Agent,
    },
    Dimension {
        name: "tag",
        table: "LiteLLM_DailyTagSpend",
        id_column: "tag",
        kind: DimensionKind::Tag,
    },
];

/// Aggregation projection of one spend-log row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SpendLogRow {
    pub request_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub endpoint: String,
    pub model: String,
    pub model_group: String,
    pub provider: String,
    pub mcp_tool: String,
    pub api_key_hash: String,
    pub user_id: String,
    pub team_id: String,
    pub organization_id: String,
    pub end_user_id: String,
    pub agent_id: String,
    pub request_tags: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub spend: f64,
    pub status: String,
}

/// Grouping key of the daily tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DailyKey {
    pub entity_id: String,
    pub date: NaiveDate,
    pub api_key: String,
    pub model: String,
    pub model_group: String,
    pub provider: String,
    pub mcp_tool: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DailyTotals {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub spend: f64,
    pub api_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
}

/// Group rows for one dimension. Rows whose dimension id is empty are
/// skipped; the tag dimension fans one row out to one group per parsed tag
/// and drops rows whose tag array fails to parse.
pub(crate) fn group_rows(
    kind: DimensionKind,
    rows: &[SpendLogRow],
) -> HashMap<DailyKey, DailyTotals> {
    let mut groups: HashMap<DailyKey, DailyTotals> = HashMap::new();

    for row in rows {
        let ids: Vec<String> = match kind {
            DimensionKind::User => vec![row.user_id.clone()],
            DimensionKind::Team => vec![row.team_id.clone()],
            DimensionKind::Organization => vec![row.organization_id.clone()],
            DimensionKind::EndUser => vec![row.end_user_id.clone()],
            DimensionKind::Agent => vec![row.agent_id.clone()],
            DimensionKind::Tag => match serde_json::from_str::<Vec<String>>(&row.request_tags) {
                Ok(tags) => tags,
                Err(err) => {
                    warn!(
                        request_id = %row.request_id,
                        error = %err,
                        "malformed request tags; dropping row from tag aggregation"
                    );
                    continue;
                }
            },
        };

        for id in ids {
            if id.is_empty() {
                continue;
            }
            let key = DailyKey {
                entity_id: id,
                date: row.completed_at.date_naive(),
                api_key: row.api_key_hash.clone(),
                model: row.model.clone(),
                model_group: row.model_group.clone(),
                provider: row.provider.clone(),
                mcp_tool: row.mcp_tool.clone(),
                endpoint: row.endpoint.clone(),
            };
            let totals = groups.entry(key).or_default();
            totals.prompt_tokens += row.prompt_tokens;
            totals.completion_tokens += row.completion_tokens;
            totals.spend += row.spend;
            totals.api_requests += 1;
            if row.status == "success" {
                totals.successful_requests += 1;
            } else {
                totals.failed_requests += 1;
            }
        }
    }

    groups
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Worker that services the push channel and the safety-net ticker.
pub(crate) struct AggregationScheduler {
    pool: Arc<DbPool>,
    stats: Arc<AggregationStats>,
    interval: Duration,
}

impl AggregationScheduler {
    pub(crate) fn new(pool: Arc<DbPool>, stats: Arc<AggregationStats>, interval: Duration) -> Self {
        Self {
            pool,
            stats,
            interval,
        }
    }

    pub(crate) async fn run(
        self,
        mut rx: mpsc::Receiver<Vec<Uuid>>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                maybe = rx.recv() => match maybe {
                    Some(ids) => self.aggregate_by_ids(&ids).await,
                    None => break,
                },
                _ = ticker.tick() => self.safety_net_pass().await,
            }
        }
        debug!("aggregation worker exited");
    }

    /// Push path: fold the rows this replica just committed. Never marks
    /// rows processed (that is the safety net's job), so repeating work
    /// here only re-adds into idempotent summing upserts.
    async fn aggregate_by_ids(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let outcome =
            tokio::time::timeout(PUSH_AGGREGATION_BUDGET, self.aggregate_ids_once(ids)).await;
        match outcome {
            Ok(Ok(())) => debug!(ids = ids.len(), "push aggregation complete"),
            Ok(Err(err)) => warn!(
                ids = ids.len(),
                error = %err,
                "push aggregation failed; safety net will retry"
            ),
            Err(_elapsed) => warn!(
                ids = ids.len(),
                "push aggregation timed out; safety net will retry"
            ),
        }
    }

    async fn aggregate_ids_once(&self, ids: &[Uuid]) -> Result<(), GateError> {
        let mut conn = self.pool.acquire().await?;
        let rows = load_rows(&mut conn, ids).await?;
        run_dimensions(&mut conn, &rows).await
    }

    /// Safety net: one advisory-locked sweep over every unprocessed row.
    async fn safety_net_pass(&self) {
        if let Err(err) = self.safety_net_once().await {
            warn!(error = %err, "safety net aggregation pass failed");
        }
    }

    async fn safety_net_once(&self) -> Result<(), GateError> {
        let mut conn = self.pool.acquire().await?;

        let locked: bool = sqlx::query_scalar(queries::TRY_ADVISORY_LOCK)
            .bind(queries::AGGREGATION_LOCK_ID)
            .fetch_one(&mut *conn)
            .await
            .map_err(GateError::connection)?;
        if !locked {
            debug!("safety net skipped; another replica holds the aggregation lock");
            return Ok(());
        }

        let result = self.sweep_under_lock(&mut conn).await;

        // Unlock on the same connection before it returns to the pool; an
        // advisory lock released by pool reuse would serialize nothing.
        if let Err(err) = sqlx::query(queries::ADVISORY_UNLOCK)
            .bind(queries::AGGREGATION_LOCK_ID)
            .execute(&mut *conn)
            .await
        {
            warn!(error = %err, "advisory unlock failed");
        }
        drop(conn);

        result
    }

    async fn sweep_under_lock(
        &self,
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<(), GateError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(queries::SELECT_UNPROCESSED_REQUEST_IDS)
            .fetch_all(&mut **conn)
            .await
            .map_err(GateError::connection)?;
        if ids.is_empty() {
            return Ok(());
        }

        let rows = load_rows(conn, &ids).await?;
        // Any aggregator error leaves the whole id set unprocessed; the
        // next tick retries and the summing upserts absorb the repeats.
        run_dimensions(conn, &rows).await?;

        sqlx::query(queries::MARK_SPEND_LOGS_PROCESSED)
            .bind(&ids[..])
            .execute(&mut **conn)
            .await
            .map_err(GateError::connection)?;

        self.stats.record_run();
        info!(rows = ids.len(), "safety net aggregation pass complete");
        Ok(())
    }
}

async fn load_rows(
    conn: &mut PoolConnection<Postgres>,
    ids: &[Uuid],
) -> Result<Vec<SpendLogRow>, GateError> {
    let rows = sqlx::query(queries::SELECT_SPEND_LOGS_BY_IDS)
        .bind(ids)
        .fetch_all(&mut **conn)
        .await
        .map_err(GateError::connection)?;
    rows.iter().map(spend_log_row).collect()
}

fn spend_log_row(row: &PgRow) -> Result<SpendLogRow, GateError> {
    let get = |err: sqlx::Error| GateError::connection(err);
    Ok(SpendLogRow {
        request_id: row.try_get("request_id").map_err(get)?,
        completed_at: row.try_get("endTime").map_err(get)?,
        endpoint: text(row, "endpoint")?,
        model: text(row, "model")?,
        model_group: text(row, "model_group")?,
        provider: text(row, "custom_llm_provider")?,
        mcp_tool: text(row, "mcp_tool_name")?,
        api_key_hash: text(row, "api_key")?,
        user_id: text(row, "user_id")?,
        team_id: text(row, "team_id")?,
        organization_id: text(row, "organization_id")?,
        end_user_id: text(row, "end_user_id")?,
        agent_id: text(row, "agent_id")?,
        request_tags: row
            .try_get::<Option<String>, _>("request_tags")
            .map_err(get)?
            .unwrap_or_else(|| "[]".to_string()),
        prompt_tokens: row
            .try_get::<Option<i64>, _>("prompt_tokens")
            .map_err(get)?
            .unwrap_or(0),
        completion_tokens: row
            .try_get::<Option<i64>, _>("completion_tokens")
            .map_err(get)?
            .unwrap_or(0),
        spend: row
            .try_get::<Option<f64>, _>("spend")
            .map_err(get)?
            .unwrap_or(0.0),
        status: text(row, "status")?,
    })
}

fn text(row: &PgRow, column: &str) -> Result<String, GateError> {
    Ok(row
        .try_get::<Option<String>, _>(column)
        .map_err(GateError::connection)?
        .unwrap_or_default())
}

/// Dispatch the six dimensional aggregators in sequence, each with its own
/// deadline.
async fn run_dimensions(
    conn: &mut PoolConnection<Postgres>,
    rows: &[SpendLogRow],
) -> Result<(), GateError> {
    for dimension in &DIMENSIONS {
        match tokio::time::timeout(DIMENSION_BUDGET, aggregate_dimension(conn, dimension, rows))
            .await
        {
            Ok(result) => result?,
            Err(_elapsed) => {
                return Err(GateError::ConnectionFailed(format!(
                    "{} aggregation timed out",
                    dimension.name
                )));
            }
        }
    }
    Ok(())
}

/// One upsert per group against the dimension's daily table.
async fn aggregate_dimension(
    conn: &mut PoolConnection<Postgres>,
    dimension: &Dimension,
    rows: &[SpendLogRow],
) -> Result<(), GateError> {
    let groups = group_rows(dimension.kind, rows);
    if groups.is_empty() {
        return Ok(());
    }

    let sql = queries::build_daily_spend_upsert(dimension.table, dimension.id_column);
    for (key, totals) in &groups {
        sqlx::query(&sql)
            .bind(key.entity_id.as_str())
            .bind(key.date)
            .bind(key.api_key.as_str())
            .bind(key.model.as_str())
            .bind(key.model_group.as_str())
            .bind(key.provider.as_str())
            .bind(key.mcp_tool.as_str())
            .bind(key.endpoint.as_str())
            .bind(totals.prompt_tokens)
            .bind(totals.completion_tokens)
            .bind(totals.spend)
            .bind(totals.api_requests)
            .bind(totals.successful_requests)
            .bind(totals.failed_requests)
            .execute(&mut **conn)
            .await
            .map_err(GateError::connection)?;
    }
    debug!(
        dimension = dimension.name,
        groups = groups.len(),
        "dimension aggregated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, tags: &str, spend: f64, status: &str, model: &str) -> SpendLogRow {
        SpendLogRow {
            request_id: Uuid::new_v4(),
            completed_at: "2026-07-30T10:00:00Z".parse().expect("timestamp"),
            endpoint: "/v1/chat/completions".to_string(),
            model: model.to_string(),
            model_group: "gpt".to_string(),
            provider: "openai".to_string(),
            mcp_tool: String::new(),
            api_key_hash: "k1".to_string(),
            user_id: user.to_string(),
            team_id: String::new(),
            organization_id: String::new(),
            end_user_id: String::new(),
            agent_id: String::new(),
            request_tags: tags.to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            spend,
            status: status.to_string(),
        }
    }

    #[test]
    fn user_dimension_groups_and_counts_status() {
        let rows = vec![
            row("u1", "[]", 1.0, "success", "gpt-4o"),
            row("u1", "[]", 2.0, "failure", "gpt-4o"),
            row("", "[]", 9.0, "success", "gpt-4o"),
            row("u1", "[]", 0.5, "success", "gpt-4o-mini"),
        ];
        let groups = group_rows(DimensionKind::User, &rows);

        // Empty user id skipped; two models means two groups for u1.
        assert_eq!(groups.len(), 2);
        let (key, totals) = groups
            .iter()
            .find(|(k, _)| k.model == "gpt-4o")
            .expect("gpt-4o group");
        assert_eq!(key.entity_id, "u1");
        assert_eq!(totals.api_requests, 2);
        assert_eq!(totals.successful_requests, 1);
        assert_eq!(totals.failed_requests, 1);
        assert!((totals.spend - 3.0).abs() < 1e-9);
        assert_eq!(totals.prompt_tokens, 20);
    }

    #[test]
    fn tag_dimension_fans_out_and_drops_malformed() {
        let rows = vec![
            row("u1", r#"["prod","batch"]"#, 1.0, "success", "gpt-4o"),
            row("u2", "not json", 5.0, "success", "gpt-4o"),
            row("u3", "[]", 2.0, "success", "gpt-4o"),
        ];
        let groups = group_rows(DimensionKind::Tag, &rows);

        assert_eq!(groups.len(), 2);
        let tags: Vec<&str> = groups.keys().map(|k| k.entity_id.as_str()).collect();
        assert!(tags.contains(&"prod"));
        assert!(tags.contains(&"batch"));
        for totals in groups.values() {
            assert!((totals.spend - 1.0).abs() < 1e-9);
        }
    }
}
