//! Business logic and port traits for Companion.
//!
//! Everything that decides *what happens* during a conversation turn lives
//! here; storage, model and speech back-ends are reached only through the
//! traits in this crate and implemented in `companion-infra`.

pub mod cache;
pub mod chat;
pub mod emotion;
pub mod knowledge;
pub mod ledger;
pub mod llm;
pub mod memory;
pub mod persona;
pub mod speech;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;
