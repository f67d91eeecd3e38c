use chrono::{DateTime, Utc};

/// Immutable snapshot of one API key and its budget hierarchy, taken from
/// the catalog on each cache refresh.
///
/// Every optional field maps a nullable catalog column; `None` is
/// distinguishable from zero everywhere. `models` is order-insensitive and
/// an empty list means the key may call any model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenInfo {
    // Identity.
    pub token_hash: String,
    pub key_name: Option<String>,
    pub key_alias: Option<String>,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub organization_id: Option<String>,

    // Token-level budget (embedded on the key row).
    pub spend: f64,
    pub max_budget: Option<f64>,
    pub tpm_limit: Option<i64>,
    pub rpm_limit: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub blocked: bool,
    pub models: Vec<String>,

    // User level (embedded on the user row).
    pub user_max_budget: Option<f64>,
    pub user_spend: Option<f64>,
    pub user_alias: Option<String>,
    pub user_email: Option<String>,

    // Team level (embedded on the team row).
    pub team_max_budget: Option<f64>,
    pub team_spend: Option<f64>,
    pub team_blocked: Option<bool>,
    pub team_tpm_limit: Option<i64>,
    pub team_rpm_limit: Option<i64>,
    pub team_alias: Option<String>,

    // Organization budget (external budget row).
    pub org_spend: Option<f64>,
    pub org_max_budget: Option<f64>,
    pub org_tpm_limit: Option<i64>,
    pub org_rpm_limit: Option<i64>,

    // Team membership budget (external budget row).
    pub team_member_spend: Option<f64>,
    pub team_member_max_budget: Option<f64>,
    pub team_member_tpm_limit: Option<i64>,
    pub team_member_rpm_limit: Option<i64>,

    // Organization membership budget (external budget row).
    pub org_member_spend: Option<f64>,
    pub org_member_max_budget: Option<f64>,
    pub org_member_tpm_limit: Option<i64>,
    pub org_member_rpm_limit: Option<i64>,
}

impl TokenInfo {
    /// A personal key is one not attached to a team. User-level budget
    /// checks apply only to personal keys.
    pub fn is_personal_key(&self) -> bool {
        match &self.team_id {
            None => true,
            Some(t) => t.is_empty(),
        }
    }

    /// Whether this key may call `model`. An empty allow-list permits all
    /// models; membership is order-insensitive.
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}
