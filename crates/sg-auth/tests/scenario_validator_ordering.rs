use chrono::{Duration as ChronoDuration, Utc};

use sg_auth::validate_token_info;
use sg_types::{BudgetLevel, GateError, TokenInfo};

fn base() -> TokenInfo {
    TokenInfo {
        token_hash: "h".to_string(),
        ..TokenInfo::default()
    }
}

#[test]
fn scenario_budget_boundary() {
    // Embedded budgets use strict >: sitting exactly on the limit passes.
    let mut info = base();
    info.spend = 100.0;
    info.max_budget = Some(100.0);
    assert!(validate_token_info(&info, "").is_ok());

    info.spend = 100.0001;
    assert_eq!(
        validate_token_info(&info, ""),
        Err(GateError::BudgetExceeded {
            level: BudgetLevel::Token,
            spend: 100.0001,
            max_budget: 100.0,
        })
    );
}

#[test]
fn scenario_blocked_precedes_everything() {
    let mut info = base();
    info.blocked = true;
    info.expires_at = Some(Utc::now() - ChronoDuration::hours(1));
    info.spend = 10.0;
    info.max_budget = Some(1.0);
    assert_eq!(validate_token_info(&info, ""), Err(GateError::TokenBlocked));
}

#[test]
fn scenario_expiry_precedes_budgets() {
    let expired_at = Utc::now() - ChronoDuration::minutes(5);
    let mut info = base();
    info.expires_at = Some(expired_at);
    info.spend = 10.0;
    info.max_budget = Some(1.0);
    assert_eq!(
        validate_token_info(&info, ""),
        Err(GateError::TokenExpired(expired_at))
    );

    // A future expiry is not a failure.
    info.expires_at = Some(Utc::now() + ChronoDuration::hours(1));
    info.spend = 0.0;
    assert!(validate_token_info(&info, "").is_ok());
}

#[test]
fn scenario_team_budget_checked_before_memberships() {
    let mut info = base();
    info.team_id = Some("t1".to_string());
    info.team_spend = Some(51.0);
    info.team_max_budget = Some(50.0);
    // Team-member level would also fail, but team fires first.
    info.team_member_spend = Some(10.0);
    info.team_member_max_budget = Some(10.0);
    match validate_token_info(&info, "") {
        Err(GateError::BudgetExceeded { level, .. }) => assert_eq!(level, BudgetLevel::Team),
        other => panic!("expected team budget failure, got {other:?}"),
    }
}

#[test]
fn scenario_external_budgets_fail_on_equality() {
    // Team membership: external counter, >= comparison.
    let mut info = base();
    info.team_id = Some("t1".to_string());
    info.team_member_spend = Some(25.0);
    info.team_member_max_budget = Some(25.0);
    match validate_token_info(&info, "") {
        Err(GateError::BudgetExceeded { level, .. }) => {
            assert_eq!(level, BudgetLevel::TeamMember)
        }
        other => panic!("expected team member failure, got {other:?}"),
    }

    // Organization: >= as well, but a non-positive max disables the check.
    let mut info = base();
    info.org_spend = Some(100.0);
    info.org_max_budget = Some(0.0);
    assert!(validate_token_info(&info, "").is_ok());

    info.org_max_budget = Some(100.0);
    match validate_token_info(&info, "") {
        Err(GateError::BudgetExceeded { level, .. }) => {
            assert_eq!(level, BudgetLevel::Organization)
        }
        other => panic!("expected organization failure, got {other:?}"),
    }
}

#[test]
fn scenario_user_budget_applies_to_personal_keys_only() {
    let mut info = base();
    info.user_spend = Some(11.0);
    info.user_max_budget = Some(10.0);

    // Team key: the user budget is skipped.
    info.team_id = Some("t1".to_string());
    assert!(validate_token_info(&info, "").is_ok());

    // Personal key (empty team id counts as personal).
    info.team_id = Some(String::new());
    match validate_token_info(&info, "") {
        Err(GateError::BudgetExceeded { level, .. }) => assert_eq!(level, BudgetLevel::User),
        other => panic!("expected user budget failure, got {other:?}"),
    }
}

#[test]
fn scenario_org_member_budget_is_last_budget_check() {
    let mut info = base();
    info.org_member_spend = Some(5.0);
    info.org_member_max_budget = Some(5.0);
    match validate_token_info(&info, "") {
        Err(GateError::BudgetExceeded { level, .. }) => assert_eq!(level, BudgetLevel::OrgMember),
        other => panic!("expected org member failure, got {other:?}"),
    }
}

#[test]
fn scenario_model_allow_list() {
    let mut info = base();
    // Empty allow-list permits everything.
    assert!(validate_token_info(&info, "gpt-4o").is_ok());

    info.models = vec!["gpt-4o".to_string(), "claude-sonnet".to_string()];
    assert!(validate_token_info(&info, "claude-sonnet").is_ok());
    // No model requested: the allow-list is not consulted.
    assert!(validate_token_info(&info, "").is_ok());
    assert_eq!(
        validate_token_info(&info, "gpt-3.5-turbo"),
        Err(GateError::ModelNotAllowed {
            model: "gpt-3.5-turbo".to_string()
        })
    );
}
