// crates/sg-auth/src/lib.rs
//! Read path of the spendgate data plane: token normalization, the TTL+LRU
//! token cache, pure hierarchy validation, and the authenticator that ties
//! them to the catalog.

mod authenticator;
pub mod cache;
mod token;
mod validate;

pub use authenticator::Authenticator;
pub use cache::{CacheStats, TokenCache};
pub use token::{hash_token, mask_token};
pub use validate::validate_token_info;
