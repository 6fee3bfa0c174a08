//! SQLite-backed identity provider with a short-lived user cache.
//!
//! Balance debits are a single conditional `UPDATE` so concurrent turns can
//! never drive a balance below zero.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use companion_core::ledger::identity::IdentityProvider;
use companion_types::error::{LedgerError, RepositoryError};
use companion_types::identity::UserAccount;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid, query_err};

const DEFAULT_USER_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct SqliteIdentityProvider {
    pool: DatabasePool,
    cache: Arc<DashMap<Uuid, (UserAccount, Instant)>>,
    ttl: Duration,
}

impl SqliteIdentityProvider {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            cache: Arc::new(DashMap::new()),
            ttl: DEFAULT_USER_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Insert a user with the given starting balance.
    pub async fn create_user(
        &self,
        display_name: Option<&str>,
        balance: i64,
    ) -> Result<UserAccount, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let account = UserAccount {
            id: Uuid::now_v7(),
            display_name: display_name.map(str::to_owned),
            balance: balance.max(0),
        };
        sqlx::query(
            r#"INSERT INTO users (id, display_name, balance, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(account.id.to_string())
        .bind(&account.display_name)
        .bind(account.balance)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(account)
    }

    /// Add tokens to a user's balance. Returns the new balance.
    pub async fn credit(&self, user_id: &Uuid, amount: i64) -> Result<i64, LedgerError> {
        let row = sqlx::query(
            "UPDATE users SET balance = balance + ?, updated_at = ? WHERE id = ? RETURNING balance",
        )
        .bind(amount.max(0))
        .bind(format_datetime(&Utc::now()))
        .bind(user_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| LedgerError::Storage(e.to_string()))?;
        self.cache.remove(user_id);
        let row = row.ok_or(LedgerError::UserNotFound)?;
        row.try_get("balance")
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn cached(&self, user_id: &Uuid) -> Option<UserAccount> {
        let entry = self.cache.get(user_id)?;
        let (account, stored_at) = entry.value();
        if stored_at.elapsed() < self.ttl {
            return Some(account.clone());
        }
        drop(entry);
        self.cache.remove(user_id);
        None
    }
}

fn account_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<UserAccount, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    Ok(UserAccount {
        id: parse_uuid(&id, "user id")?,
        display_name: row.try_get("display_name").map_err(query_err)?,
        balance: row.try_get("balance").map_err(query_err)?,
    })
}

impl IdentityProvider for SqliteIdentityProvider {
    async fn get_user(&self, user_id: &Uuid) -> Result<UserAccount, LedgerError> {
        if let Some(account) = self.cached(user_id) {
            return Ok(account);
        }

        let row = sqlx::query("SELECT id, display_name, balance FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let row = row.ok_or(LedgerError::UserNotFound)?;
        let account = account_from_row(&row)?;

        self.cache.insert(*user_id, (account.clone(), Instant::now()));
        Ok(account)
    }

    async fn debit(&self, user_id: &Uuid, amount: i64) -> Result<i64, LedgerError> {
        let amount = amount.max(0);
        let row = sqlx::query(
            r#"UPDATE users
               SET balance = CASE WHEN balance >= ? THEN balance - ? ELSE 0 END,
                   updated_at = ?
               WHERE id = ?
               RETURNING balance"#,
        )
        .bind(amount)
        .bind(amount)
        .bind(format_datetime(&Utc::now()))
        .bind(user_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| LedgerError::Storage(e.to_string()))?;

        self.cache.remove(user_id);
        let row = row.ok_or(LedgerError::UserNotFound)?;
        let balance: i64 = row
            .try_get("balance")
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        debug!(%user_id, amount, balance, "balance debited");
        Ok(balance)
    }

    fn invalidate_cache(&self, user_id: &Uuid) {
        self.cache.remove(user_id);
    }
}
