// crates/sg-types/src/lib.rs
//! Shared data model for the spendgate data plane.
//!
//! Types here are plain snapshots: built once from a catalog read or an
//! incoming request, then passed by value / `Arc` and never mutated in
//! place. Refreshes replace, they do not patch.

mod error;
mod spend_entry;
mod token_info;

pub use error::{BudgetLevel, GateError};
pub use spend_entry::SpendLogEntry;
pub use token_info::TokenInfo;
