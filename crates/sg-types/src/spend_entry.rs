use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One proxied API call, as recorded in the spend log.
///
/// Built by the proxy when the upstream call completes, owned by the spend
/// logger from enqueue until the inserting transaction commits, then
/// referenced by `request_id` only.
///
/// `metadata` is a JSON object string and `request_tags` a JSON array
/// string; both are stored verbatim. `status` is `"success"` or
/// `"failure"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendLogEntry {
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub call_type: String,
    pub endpoint: String,
    pub model: String,
    pub model_id: String,
    pub model_group: String,
    pub provider: String,
    pub session_id: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub metadata: String,
    pub spend: f64,
    pub api_key_hash: String,
    pub user_id: String,
    pub team_id: String,
    pub organization_id: String,
    pub end_user_id: String,
    pub agent_id: String,
    pub request_tags: String,
    pub status: String,
    pub requester_ip: String,
    pub mcp_tool: Option<String>,
}

impl Default for SpendLogEntry {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4(),
            started_at: now,
            completed_at: now,
            call_type: String::new(),
            endpoint: String::new(),
            model: String::new(),
            model_id: String::new(),
            model_group: String::new(),
            provider: String::new(),
            session_id: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            metadata: "{}".to_string(),
            spend: 0.0,
            api_key_hash: String::new(),
            user_id: String::new(),
            team_id: String::new(),
            organization_id: String::new(),
            end_user_id: String::new(),
            agent_id: String::new(),
            request_tags: "[]".to_string(),
            status: "success".to_string(),
            requester_ip: String::new(),
            mcp_tool: None,
        }
    }
}

impl SpendLogEntry {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}
