//! TokenLedger -- balance gate and usage debits.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use companion_types::error::{LedgerError, TurnError};
use companion_types::llm::Usage;

use super::identity::BoxIdentityProvider;

/// Converts model usage into balance debits against the identity store.
#[derive(Clone)]
pub struct TokenLedger {
    identity: Arc<BoxIdentityProvider>,
}

impl TokenLedger {
    pub fn new(identity: Arc<BoxIdentityProvider>) -> Self {
        Self { identity }
    }

    pub async fn get_balance(&self, user_id: &Uuid) -> Result<i64, LedgerError> {
        Ok(self.identity.get_user(user_id).await?.balance)
    }

    /// Reject the turn unless the user has a positive balance.
    ///
    /// Returns the balance seen, used later as the starting balance.
    pub async fn ensure_can_spend(&self, user_id: &Uuid) -> Result<i64, TurnError> {
        let balance = match self.get_balance(user_id).await {
            Ok(b) => b,
            Err(LedgerError::UserNotFound) => return Err(TurnError::NotFound("user".into())),
            Err(e) => return Err(e.into()),
        };
        if balance <= 0 {
            debug!(%user_id, balance, "turn rejected: insufficient balance");
            return Err(TurnError::InsufficientBalance { balance });
        }
        Ok(balance)
    }

    /// Debit prompt + completion tokens. With no usage the balance is left
    /// alone and `starting_balance` is returned.
    #[tracing::instrument(skip(self, usage), fields(cost = tracing::field::Empty))]
    pub async fn apply_usage(
        &self,
        user_id: &Uuid,
        usage: Option<&Usage>,
        starting_balance: i64,
    ) -> Result<i64, LedgerError> {
        let Some(usage) = usage else {
            return Ok(starting_balance);
        };
        let cost = i64::try_from(usage.total()).unwrap_or(i64::MAX);
        tracing::Span::current().record("cost", cost);
        if cost == 0 {
            return Ok(starting_balance);
        }

        self.identity.debit(user_id, cost).await?;
        self.identity.invalidate_cache(user_id);
        let balance = self.get_balance(user_id).await?;
        info!(%user_id, cost, balance, "token usage debited");
        Ok(balance)
    }
}
