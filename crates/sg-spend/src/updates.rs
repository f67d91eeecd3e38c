//! Per-batch spend deltas, one map per hierarchy level.

use std::collections::HashMap;

use sg_types::SpendLogEntry;

/// Summed spend deltas for one committed batch.
///
/// `tokens` covers every entry (the api key hash is always present), so its
/// value sum equals the batch's total spend. Every other map omits entries
/// whose grouping id is absent on the source row. Membership maps use
/// composite `"parent:user"` keys; consumers re-split them with
/// [`split_composite_key`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpendUpdates {
    pub tokens: HashMap<String, f64>,
    pub users: HashMap<String, f64>,
    pub teams: HashMap<String, f64>,
    pub orgs: HashMap<String, f64>,
    pub team_members: HashMap<String, f64>,
    pub org_members: HashMap<String, f64>,
}

impl SpendUpdates {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
            && self.users.is_empty()
            && self.teams.is_empty()
            && self.orgs.is_empty()
            && self.team_members.is_empty()
            && self.org_members.is_empty()
    }
}

/// Fold a batch of entries into per-level spend deltas.
pub fn aggregate_spend_updates<'a, I>(entries: I) -> SpendUpdates
where
    I: IntoIterator<Item = &'a SpendLogEntry>,
{
    let mut updates = SpendUpdates::default();
    for entry in entries {
        *updates
            .tokens
            .entry(entry.api_key_hash.clone())
            .or_default() += entry.spend;

        if !entry.user_id.is_empty() {
            *updates.users.entry(entry.user_id.clone()).or_default() += entry.spend;
        }
        if !entry.team_id.is_empty() {
            *updates.teams.entry(entry.team_id.clone()).or_default() += entry.spend;
        }
        if !entry.organization_id.is_empty() {
            *updates
                .orgs
                .entry(entry.organization_id.clone())
                .or_default() += entry.spend;
        }
        if !entry.team_id.is_empty() && !entry.user_id.is_empty() {
            *updates
                .team_members
                .entry(format!("{}:{}", entry.team_id, entry.user_id))
                .or_default() += entry.spend;
        }
        if !entry.organization_id.is_empty() && !entry.user_id.is_empty() {
            *updates
                .org_members
                .entry(format!("{}:{}", entry.organization_id, entry.user_id))
                .or_default() += entry.spend;
        }
    }
    updates
}

/// Split a composite `"parent:user"` update key at the first `:`.
///
/// Returns `None` when either part is empty; callers skip (and log) such
/// keys instead of issuing an update with a blank bind.
pub fn split_composite_key(key: &str) -> Option<(&str, &str)> {
    let (parent, user) = key.split_once(':')?;
    if parent.is_empty() || user.is_empty() {
        return None;
    }
    Some((parent, user))
}
