//! Conversation persistence port and prompt assembly.

pub mod context;
pub mod repository;
