//! Pure hierarchy validation of a token snapshot.
//!
//! Checks run in a fixed order and short-circuit on the first failure:
//! blocked, expiry, then the budget chain token → team → team-member →
//! organization → user (personal keys only) → org-member, then the model
//! allow-list. Embedded budget counters (token, team, user) are updated
//! transactionally with the request and may legitimately sit exactly on
//! the limit, so they compare with strict `>`; external budget rows are
//! eventually-consistent aggregates where equality already means
//! exhaustion, so they compare with `>=`.

use chrono::Utc;

use sg_types::{BudgetLevel, GateError, TokenInfo};

/// Validate a snapshot against the model (empty = no model restriction
/// requested) and the six-level budget hierarchy.
pub fn validate_token_info(info: &TokenInfo, model: &str) -> Result<(), GateError> {
    if info.blocked {
        return Err(GateError::TokenBlocked);
    }

    if let Some(expires_at) = info.expires_at {
        if expires_at < Utc::now() {
            return Err(GateError::TokenExpired(expires_at));
        }
    }

    // Token budget (embedded, strict >).
    if let Some(max_budget) = info.max_budget {
        if info.spend > max_budget {
            return Err(GateError::BudgetExceeded {
                level: BudgetLevel::Token,
                spend: info.spend,
                max_budget,
            });
        }
    }

    // Team budget (embedded, strict >).
    if let (Some(spend), Some(max_budget)) = (info.team_spend, info.team_max_budget) {
        if spend > max_budget {
            return Err(GateError::BudgetExceeded {
                level: BudgetLevel::Team,
                spend,
                max_budget,
            });
        }
    }

    // Team-member budget (external, >=).
    if let (Some(spend), Some(max_budget)) = (info.team_member_spend, info.team_member_max_budget)
    {
        if spend >= max_budget {
            return Err(GateError::BudgetExceeded {
                level: BudgetLevel::TeamMember,
                spend,
                max_budget,
            });
        }
    }

    // Organization budget (external, >=). A non-positive max means the
    // organization has no enforced budget.
    if let (Some(spend), Some(max_budget)) = (info.org_spend, info.org_max_budget) {
        if max_budget > 0.0 && spend >= max_budget {
            return Err(GateError::BudgetExceeded {
                level: BudgetLevel::Organization,
                spend,
                max_budget,
            });
        }
    }

    // User budget (embedded, strict >) applies to personal keys only;
    // team-key usage is accounted against the team, not the owner.
    if info.is_personal_key() {
        if let (Some(spend), Some(max_budget)) = (info.user_spend, info.user_max_budget) {
            if spend > max_budget {
                return Err(GateError::BudgetExceeded {
                    level: BudgetLevel::User,
                    spend,
                    max_budget,
                });
            }
        }
    }

    // Org-member budget (external, >=).
    if let (Some(spend), Some(max_budget)) = (info.org_member_spend, info.org_member_max_budget) {
        if spend >= max_budget {
            return Err(GateError::BudgetExceeded {
                level: BudgetLevel::OrgMember,
                spend,
                max_budget,
            });
        }
    }

    if !model.is_empty() && !info.allows_model(model) {
        return Err(GateError::ModelNotAllowed {
            model: model.to_string(),
        });
    }

    Ok(())
}
