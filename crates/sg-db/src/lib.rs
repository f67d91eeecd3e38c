// crates/sg-db/src/lib.rs
//! PostgreSQL access layer for the spendgate data plane.
//!
//! Owns the typed connection-pool wrapper, the circuit-breaker health
//! monitor consumed by the proxy, every SQL contract against the LiteLLM
//! catalog, and DSN redaction for logs.

pub mod health;
pub mod pool;
pub mod queries;
mod redact;

pub use health::{HealthMonitor, HealthMonitorConfig, HealthSource};
pub use pool::{ConnectionStats, DbPool};
pub use redact::mask_database_url;
