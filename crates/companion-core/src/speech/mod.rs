//! Speech synthesis ports and the pure voice/preference resolver.

pub mod box_provider;
pub mod preferences;
pub mod provider;
pub mod session;
