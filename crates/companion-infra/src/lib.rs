//! Infrastructure layer for Companion.
//!
//! Contains implementations of the port traits defined in `companion-core`:
//! SQLite storage, the in-process recent-message cache, the OpenAI-compatible
//! chat client and the HTTP speech gateway client, plus configuration loading.

pub mod cache;
pub mod config;
pub mod llm;
pub mod speech;
pub mod sqlite;
