//! Token accounting: identity port and the balance ledger.

pub mod identity;
pub mod service;

pub use identity::{BoxIdentityProvider, IdentityProvider};
pub use service::TokenLedger;
