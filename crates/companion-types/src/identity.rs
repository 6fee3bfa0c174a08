//! User account as seen by the token ledger.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub display_name: Option<String>,
    /// Remaining token balance. Never negative.
    pub balance: i64,
}
