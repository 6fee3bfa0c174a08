//! SQLite implementation of the per (agent, user) memory row.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::Row;
use uuid::Uuid;

use companion_core::memory::store::ProfileRepository;
use companion_types::chat::UserAgentMemory;
use companion_types::error::RepositoryError;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid, query_err};

pub struct SqliteProfileRepository {
    pool: DatabasePool,
}

impl SqliteProfileRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct MemoryRow {
    agent_id: String,
    user_id: String,
    preferences: String,
    profile_summary: Option<String>,
    last_task: Option<String>,
}

impl MemoryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            agent_id: row.try_get("agent_id")?,
            user_id: row.try_get("user_id")?,
            preferences: row.try_get("preferences")?,
            profile_summary: row.try_get("profile_summary")?,
            last_task: row.try_get("last_task")?,
        })
    }

    fn into_memory(self) -> Result<UserAgentMemory, RepositoryError> {
        Ok(UserAgentMemory {
            agent_id: parse_uuid(&self.agent_id, "agent_id")?,
            user_id: parse_uuid(&self.user_id, "user_id")?,
            preferences: parse_preferences(&self.preferences),
            profile_summary: self.profile_summary,
            last_task: self.last_task,
        })
    }
}

/// Stored preference documents that are not JSON objects read as empty.
fn parse_preferences(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl ProfileRepository for SqliteProfileRepository {
    async fn get_memory(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<UserAgentMemory>, RepositoryError> {
        let row =
            sqlx::query("SELECT * FROM user_agent_memories WHERE agent_id = ? AND user_id = ?")
                .bind(agent_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_err)?;

        match row {
            Some(ref r) => Ok(Some(
                MemoryRow::from_row(r).map_err(query_err)?.into_memory()?,
            )),
            None => Ok(None),
        }
    }

    async fn upsert_preferences(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
        preferences: &Map<String, Value>,
    ) -> Result<UserAgentMemory, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row =
            sqlx::query("SELECT * FROM user_agent_memories WHERE agent_id = ? AND user_id = ?")
                .bind(agent_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?;

        let mut memory = match row {
            Some(ref r) => MemoryRow::from_row(r).map_err(query_err)?.into_memory()?,
            None => UserAgentMemory::empty(*agent_id, *user_id),
        };
        for (key, value) in preferences {
            memory.preferences.insert(key.clone(), value.clone());
        }

        sqlx::query(
            r#"INSERT INTO user_agent_memories (agent_id, user_id, preferences, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (agent_id, user_id)
               DO UPDATE SET preferences = excluded.preferences, updated_at = excluded.updated_at"#,
        )
        .bind(agent_id.to_string())
        .bind(user_id.to_string())
        .bind(Value::Object(memory.preferences.clone()).to_string())
        .bind(format_datetime(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(memory)
    }
}
