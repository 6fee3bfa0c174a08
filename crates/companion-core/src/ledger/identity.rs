//! Identity & balance collaborator port.

use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

use companion_types::error::LedgerError;
use companion_types::identity::UserAccount;

/// Access to user accounts and their token balance.
pub trait IdentityProvider: Send + Sync {
    fn get_user(
        &self,
        user_id: &Uuid,
    ) -> impl Future<Output = Result<UserAccount, LedgerError>> + Send;

    /// Subtract `amount` from the stored balance in a single conditional
    /// statement, clamping at zero. Returns the stored balance afterwards.
    fn debit(
        &self,
        user_id: &Uuid,
        amount: i64,
    ) -> impl Future<Output = Result<i64, LedgerError>> + Send;

    /// Drop any cached copy of the user record.
    fn invalidate_cache(&self, user_id: &Uuid);
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait IdentityProviderDyn: Send + Sync {
    fn get_user_boxed<'a>(&'a self, user_id: &'a Uuid)
    -> BoxFuture<'a, Result<UserAccount, LedgerError>>;

    fn debit_boxed<'a>(&'a self, user_id: &'a Uuid, amount: i64)
    -> BoxFuture<'a, Result<i64, LedgerError>>;

    fn invalidate_cache(&self, user_id: &Uuid);
}

impl<T: IdentityProvider> IdentityProviderDyn for T {
    fn get_user_boxed<'a>(
        &'a self,
        user_id: &'a Uuid,
    ) -> BoxFuture<'a, Result<UserAccount, LedgerError>> {
        Box::pin(self.get_user(user_id))
    }

    fn debit_boxed<'a>(
        &'a self,
        user_id: &'a Uuid,
        amount: i64,
    ) -> BoxFuture<'a, Result<i64, LedgerError>> {
        Box::pin(self.debit(user_id, amount))
    }

    fn invalidate_cache(&self, user_id: &Uuid) {
        IdentityProvider::invalidate_cache(self, user_id)
    }
}

/// Type-erased identity provider.
pub struct BoxIdentityProvider {
    inner: Box<dyn IdentityProviderDyn + Send + Sync>,
}

impl BoxIdentityProvider {
    pub fn new<T: IdentityProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub async fn get_user(&self, user_id: &Uuid) -> Result<UserAccount, LedgerError> {
        self.inner.get_user_boxed(user_id).await
    }

    pub async fn debit(&self, user_id: &Uuid, amount: i64) -> Result<i64, LedgerError> {
        self.inner.debit_boxed(user_id, amount).await
    }

    pub fn invalidate_cache(&self, user_id: &Uuid) {
        self.inner.invalidate_cache(user_id)
    }
}
