//! Every SQL contract the data plane speaks, in one place.
//!
//! All statements are parameterized; query text never depends on request
//! data, only on row counts. Catalog tables follow the LiteLLM schema.

/// Health ping. Returns one integer row.
pub const PING: &str = "SELECT 1";

/// Single hierarchy read for one token hash (`$1`).
///
/// Returns exactly the 35 columns of the token snapshot, in declared order:
/// token identity and embedded budget, then the embedded user and team
/// levels, then the external organization / team-membership /
/// org-membership budget rows. External budget limits come from
/// `"LiteLLM_BudgetTable"` rows; their spend counters live on the owning
/// row.
pub const SELECT_TOKEN_HIERARCHY: &str = r#"
SELECT
    t.token                  AS token_hash,
    t.key_name,
    t.key_alias,
    t.user_id,
    t.team_id,
    t.organization_id,
    t.spend,
    t.max_budget,
    t.tpm_limit,
    t.rpm_limit,
    t.expires                AS expires_at,
    t.blocked,
    t.models,
    u.max_budget             AS user_max_budget,
    u.spend                  AS user_spend,
    u.user_alias,
    u.user_email,
    tm.max_budget            AS team_max_budget,
    tm.spend                 AS team_spend,
    tm.blocked               AS team_blocked,
    tm.tpm_limit             AS team_tpm_limit,
    tm.rpm_limit             AS team_rpm_limit,
    tm.team_alias,
    o.spend                  AS org_spend,
    ob.max_budget            AS org_max_budget,
    ob.tpm_limit             AS org_tpm_limit,
    ob.rpm_limit             AS org_rpm_limit,
    tmm.spend                AS team_member_spend,
    tmb.max_budget           AS team_member_max_budget,
    tmb.tpm_limit            AS team_member_tpm_limit,
    tmb.rpm_limit            AS team_member_rpm_limit,
    omm.spend                AS org_member_spend,
    omb.max_budget           AS org_member_max_budget,
    omb.tpm_limit            AS org_member_tpm_limit,
    omb.rpm_limit            AS org_member_rpm_limit
FROM "LiteLLM_VerificationToken" t
LEFT JOIN "LiteLLM_UserTable" u
       ON u.user_id = t.user_id
LEFT JOIN "LiteLLM_TeamTable" tm
       ON tm.team_id = t.team_id
LEFT JOIN "LiteLLM_OrganizationTable" o
       ON o.organization_id = t.organization_id
LEFT JOIN "LiteLLM_BudgetTable" ob
       ON ob.budget_id = o.budget_id
LEFT JOIN "LiteLLM_TeamMembership" tmm
       ON tmm.team_id = t.team_id AND tmm.user_id = t.user_id
LEFT JOIN "LiteLLM_BudgetTable" tmb
       ON tmb.budget_id = tmm.budget_id
LEFT JOIN "LiteLLM_OrganizationMembership" omm
       ON omm.organization_id = t.organization_id AND omm.user_id = t.user_id
LEFT JOIN "LiteLLM_BudgetTable" omb
       ON omb.budget_id = omm.budget_id
WHERE t.token = $1
"#;

/// Columns of the spend-log insert, in bind order.
pub const SPEND_LOG_COLUMNS: &str = r#"request_id, "startTime", "endTime", call_type, endpoint, model, model_id, model_group, custom_llm_provider, session_id, prompt_tokens, completion_tokens, total_tokens, metadata, spend, api_key, user_id, team_id, organization_id, end_user_id, agent_id, request_tags, status, requester_ip_address, mcp_tool_name"#;

/// Parameters per spend-log row.
pub const SPEND_LOG_PARAMS_PER_ROW: usize = 25;

/// Build the multi-row spend-log insert for `rows` entries.
///
/// Placeholders are numbered `$1..$25N`; duplicate request ids collide on
/// `ON CONFLICT (request_id) DO NOTHING` and are excluded from the
/// `RETURNING` set, which is how retried batches avoid double-counting.
/// An empty batch yields an empty string and must not be executed.
pub fn build_spend_log_insert(rows: usize) -> String {
    if rows == 0 {
        return String::new();
    }

    let mut sql = String::with_capacity(256 + rows * 128);
    sql.push_str("INSERT INTO \"LiteLLM_SpendLogs\" (");
    sql.push_str(SPEND_LOG_COLUMNS);
    sql.push_str(")\nVALUES ");

    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..SPEND_LOG_PARAMS_PER_ROW {
            if col > 0 {
                sql.push(',');
            }
            sql.push('$');
            sql.push_str(&(row * SPEND_LOG_PARAMS_PER_ROW + col + 1).to_string());
        }
        sql.push(')');
    }

    sql.push_str("\nON CONFLICT (request_id) DO NOTHING\nRETURNING request_id");
    sql
}

// ---------------------------------------------------------------------------
// Per-level spend-delta updates
// ---------------------------------------------------------------------------
//
// `spend IS NOT NULL` guards rows that explicitly disable tracking: a NULL
// counter must never be resurrected by an update.

pub const ADD_TOKEN_SPEND: &str = r#"
UPDATE "LiteLLM_VerificationToken"
   SET spend = spend + $1
 WHERE token = $2 AND spend IS NOT NULL
"#;

pub const ADD_USER_SPEND: &str = r#"
UPDATE "LiteLLM_UserTable"
   SET spend = spend + $1
 WHERE user_id = $2 AND spend IS NOT NULL
"#;

pub const ADD_TEAM_SPEND: &str = r#"
UPDATE "LiteLLM_TeamTable"
   SET spend = spend + $1
 WHERE team_id = $2 AND spend IS NOT NULL
"#;

pub const ADD_ORG_SPEND: &str = r#"
UPDATE "LiteLLM_OrganizationTable"
   SET spend = spend + $1
 WHERE organization_id = $2 AND spend IS NOT NULL
"#;

pub const ADD_TEAM_MEMBER_SPEND: &str = r#"
UPDATE "LiteLLM_TeamMembership"
   SET spend = spend + $1
 WHERE team_id = $2 AND user_id = $3 AND spend IS NOT NULL
"#;

pub const ADD_ORG_MEMBER_SPEND: &str = r#"
UPDATE "LiteLLM_OrganizationMembership"
   SET spend = spend + $1
 WHERE organization_id = $2 AND user_id = $3 AND spend IS NOT NULL
"#;

// ---------------------------------------------------------------------------
// Aggregation coordination
// ---------------------------------------------------------------------------

/// Advisory lock id for the safety-net aggregation sweep. Stable across
/// replicas; only the sweep uses it.
pub const AGGREGATION_LOCK_ID: i64 = 7_463_951_234;

pub const TRY_ADVISORY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";
pub const ADVISORY_UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

/// Spend-log rows not yet folded into the daily tables.
pub const SELECT_UNPROCESSED_REQUEST_IDS: &str = r#"
SELECT request_id
  FROM "LiteLLM_SpendLogs"
 WHERE aggregated_at IS NULL
 ORDER BY "endTime"
"#;

/// Load the aggregation projection of the given request ids (`$1 uuid[]`).
pub const SELECT_SPEND_LOGS_BY_IDS: &str = r#"
SELECT request_id,
       "endTime",
       endpoint,
       model,
       model_group,
       custom_llm_provider,
       mcp_tool_name,
       api_key,
       user_id,
       team_id,
       organization_id,
       end_user_id,
       agent_id,
       request_tags,
       prompt_tokens,
       completion_tokens,
       spend,
       status
  FROM "LiteLLM_SpendLogs"
 WHERE request_id = ANY($1)
"#;

/// Stamp rows as folded into the daily tables (`$1 uuid[]`).
pub const MARK_SPEND_LOGS_PROCESSED: &str = r#"
UPDATE "LiteLLM_SpendLogs"
   SET aggregated_at = now()
 WHERE request_id = ANY($1)
"#;

/// Build the idempotent summing upsert for one daily dimension table.
///
/// Binds, in order: the dimension id, date, api key, model, model group,
/// provider, mcp tool, endpoint, then prompt tokens, completion tokens,
/// spend, api requests, successful requests, failed requests. Re-running
/// the same group adds onto the existing row, never replaces it.
pub fn build_daily_spend_upsert(table: &str, id_column: &str) -> String {
    format!(
        r#"
INSERT INTO "{table}"
    ({id_column}, date, api_key, model, model_group, custom_llm_provider, mcp_tool_name, endpoint,
     prompt_tokens, completion_tokens, spend, api_requests, successful_requests, failed_requests)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT ({id_column}, date, api_key, model, model_group, custom_llm_provider, mcp_tool_name, endpoint)
DO UPDATE SET
    prompt_tokens       = "{table}".prompt_tokens + EXCLUDED.prompt_tokens,
    completion_tokens   = "{table}".completion_tokens + EXCLUDED.completion_tokens,
    spend               = "{table}".spend + EXCLUDED.spend,
    api_requests        = "{table}".api_requests + EXCLUDED.api_requests,
    successful_requests = "{table}".successful_requests + EXCLUDED.successful_requests,
    failed_requests     = "{table}".failed_requests + EXCLUDED.failed_requests
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_builds_no_sql() {
        assert_eq!(build_spend_log_insert(0), "");
    }

    #[test]
    fn insert_builder_numbers_placeholders_densely() {
        let sql = build_spend_log_insert(3);
        assert_eq!(sql.matches('$').count(), 3 * SPEND_LOG_PARAMS_PER_ROW);
        assert!(sql.contains("($1,"));
        assert!(sql.contains("($26,"));
        assert!(sql.contains("($51,"));
        assert!(sql.ends_with("RETURNING request_id"));
        assert!(sql.contains("ON CONFLICT (request_id) DO NOTHING"));
    }

    #[test]
    fn hierarchy_select_declares_35_columns() {
        let head = SELECT_TOKEN_HIERARCHY
            .split("FROM")
            .next()
            .expect("select head");
        // 35 columns separated by 34 commas.
        assert_eq!(head.matches(',').count(), 34);
    }

    #[test]
    fn daily_upsert_sums_rather_than_replaces() {
        let sql = build_daily_spend_upsert("LiteLLM_DailyUserSpend", "user_id");
        assert!(sql.contains(r#""LiteLLM_DailyUserSpend".spend + EXCLUDED.spend"#));
        assert!(sql.contains("ON CONFLICT (user_id, date"));
    }
}
