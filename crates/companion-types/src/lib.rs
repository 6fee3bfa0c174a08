//! Shared domain types for Companion.
//!
//! This crate contains the core domain types used across the Companion platform:
//! conversations, messages, personas, speech and emotion values, stream events,
//! configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod chat;
pub mod config;
pub mod emotion;
pub mod error;
pub mod event;
pub mod identity;
pub mod knowledge;
pub mod llm;
pub mod persona;
pub mod speech;
