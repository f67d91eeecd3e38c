use sg_spend::aggregate_spend_updates;
use sg_types::SpendLogEntry;

fn entry(api_key: &str, user: &str, team: &str, org: &str, spend: f64) -> SpendLogEntry {
    SpendLogEntry {
        api_key_hash: api_key.to_string(),
        user_id: user.to_string(),
        team_id: team.to_string(),
        organization_id: org.to_string(),
        spend,
        ..SpendLogEntry::default()
    }
}

/// The token map conserves the batch total exactly; every other map sums
/// the spend of entries carrying that grouping id.
#[test]
fn scenario_spend_conservation() {
    let batch = vec![
        entry("k1", "u1", "t1", "o1", 0.25),
        entry("k1", "u2", "t1", "", 1.75),
        entry("k2", "", "", "o1", 3.00),
        entry("k3", "u1", "", "", 0.10),
        entry("k1", "u1", "t2", "o2", 2.40),
    ];
    let total: f64 = batch.iter().map(|e| e.spend).sum();

    let updates = aggregate_spend_updates(&batch);

    let token_sum: f64 = updates.tokens.values().sum();
    assert!((token_sum - total).abs() < 1e-9);

    let user_total: f64 = batch
        .iter()
        .filter(|e| !e.user_id.is_empty())
        .map(|e| e.spend)
        .sum();
    let user_sum: f64 = updates.users.values().sum();
    assert!((user_sum - user_total).abs() < 1e-9);

    let team_total: f64 = batch
        .iter()
        .filter(|e| !e.team_id.is_empty())
        .map(|e| e.spend)
        .sum();
    let team_sum: f64 = updates.teams.values().sum();
    assert!((team_sum - team_total).abs() < 1e-9);

    let org_total: f64 = batch
        .iter()
        .filter(|e| !e.organization_id.is_empty())
        .map(|e| e.spend)
        .sum();
    let org_sum: f64 = updates.orgs.values().sum();
    assert!((org_sum - org_total).abs() < 1e-9);

    // Membership maps require both halves of their composite key.
    let member_total: f64 = batch
        .iter()
        .filter(|e| !e.team_id.is_empty() && !e.user_id.is_empty())
        .map(|e| e.spend)
        .sum();
    let member_sum: f64 = updates.team_members.values().sum();
    assert!((member_sum - member_total).abs() < 1e-9);
}

#[test]
fn scenario_empty_batch_yields_empty_updates() {
    let updates = aggregate_spend_updates(std::iter::empty());
    assert!(updates.is_empty());
}
