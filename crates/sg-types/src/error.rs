use chrono::{DateTime, Utc};
use thiserror::Error;

/// Which level of the budget hierarchy rejected the request.
///
/// Embedded levels (Token, Team, User) carry their spend counter on the
/// parent row and are compared with strict `>`; external levels
/// (TeamMember, Organization, OrgMember) live on a separate budget row and
/// are compared with `>=` because those counters are eventually-consistent
/// aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetLevel {
    Token,
    Team,
    TeamMember,
    Organization,
    User,
    OrgMember,
}

impl std::fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BudgetLevel::Token => "token",
            BudgetLevel::Team => "team",
            BudgetLevel::TeamMember => "team member",
            BudgetLevel::Organization => "organization",
            BudgetLevel::User => "user",
            BudgetLevel::OrgMember => "organization member",
        };
        f.write_str(s)
    }
}

/// The stable error taxonomy surfaced to callers of the data plane.
///
/// Callers match on variants; they never parse messages. Validation
/// variants (`TokenNotFound` … `ModelNotAllowed`) are surfaced verbatim and
/// never retried. `ConnectionFailed` is infrastructure: the read path
/// surfaces it, the write path converts it to a retry. `QueueFull` is the
/// only error `log_spend` may return.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    #[error("auth module is disabled")]
    ModuleDisabled,

    #[error("token not found")]
    TokenNotFound,

    #[error("token is blocked")]
    TokenBlocked,

    #[error("token expired at {0}")]
    TokenExpired(DateTime<Utc>),

    #[error("{level} budget exceeded: spend {spend:.4} against max {max_budget:.4}")]
    BudgetExceeded {
        level: BudgetLevel,
        spend: f64,
        max_budget: f64,
    },

    #[error("model '{model}' is not in the key's allowed model list")]
    ModelNotAllowed { model: String },

    #[error("database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("spend log queue is full")]
    QueueFull,
}

impl GateError {
    /// Wrap an infrastructure failure, keeping only its message.
    pub fn connection<E: std::fmt::Display>(err: E) -> Self {
        GateError::ConnectionFailed(err.to_string())
    }
}
