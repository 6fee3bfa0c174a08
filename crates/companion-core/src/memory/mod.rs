//! Per (agent, user) memory: rolling conversation summaries and the
//! remembered profile.

pub mod service;
pub mod store;

pub use service::ConversationMemory;
pub use store::ProfileRepository;
