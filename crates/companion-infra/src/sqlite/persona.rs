//! SQLite-backed persona provider.
//!
//! Personas and their chat configuration are managed elsewhere; this module
//! reads them for the turn pipeline and offers upserts for seeding.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use companion_core::persona::PersonaProvider;
use companion_types::error::{PersonaError, RepositoryError};
use companion_types::persona::{Persona, PersonaChatConfig};

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid, query_err};

pub struct SqlitePersonaProvider {
    pool: DatabasePool,
}

impl SqlitePersonaProvider {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_persona(&self, persona: &Persona) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO personas (id, name, description, system_prompt_override, language_default,
                                     first_turn_hint, voice_id, voice_provider, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (id) DO UPDATE SET
                   name = excluded.name,
                   description = excluded.description,
                   system_prompt_override = excluded.system_prompt_override,
                   language_default = excluded.language_default,
                   first_turn_hint = excluded.first_turn_hint,
                   voice_id = excluded.voice_id,
                   voice_provider = excluded.voice_provider,
                   updated_at = excluded.updated_at"#,
        )
        .bind(persona.id.to_string())
        .bind(&persona.name)
        .bind(&persona.description)
        .bind(&persona.system_prompt_override)
        .bind(&persona.language_default)
        .bind(&persona.first_turn_hint)
        .bind(&persona.voice_id)
        .bind(&persona.voice_provider)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    pub async fn upsert_chat_config(&self, config: &PersonaChatConfig) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO persona_chat_configs (agent_id, model, temperature, max_tokens, system_prompt,
                                                 conversation_hint, language, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (agent_id) DO UPDATE SET
                   model = excluded.model,
                   temperature = excluded.temperature,
                   max_tokens = excluded.max_tokens,
                   system_prompt = excluded.system_prompt,
                   conversation_hint = excluded.conversation_hint,
                   language = excluded.language,
                   updated_at = excluded.updated_at"#,
        )
        .bind(config.agent_id.to_string())
        .bind(&config.model)
        .bind(config.temperature)
        .bind(config.max_tokens.map(i64::from))
        .bind(&config.system_prompt)
        .bind(&config.conversation_hint)
        .bind(&config.language)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
            _ => query_err(e),
        })?;
        Ok(())
    }
}

struct PersonaRow {
    id: String,
    name: String,
    description: String,
    system_prompt_override: Option<String>,
    language_default: Option<String>,
    first_turn_hint: Option<String>,
    voice_id: Option<String>,
    voice_provider: Option<String>,
}

impl PersonaRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            system_prompt_override: row.try_get("system_prompt_override")?,
            language_default: row.try_get("language_default")?,
            first_turn_hint: row.try_get("first_turn_hint")?,
            voice_id: row.try_get("voice_id")?,
            voice_provider: row.try_get("voice_provider")?,
        })
    }

    fn into_persona(self) -> Result<Persona, RepositoryError> {
        Ok(Persona {
            id: parse_uuid(&self.id, "persona id")?,
            name: self.name,
            description: self.description,
            system_prompt_override: self.system_prompt_override,
            language_default: self.language_default,
            first_turn_hint: self.first_turn_hint,
            voice_id: self.voice_id,
            voice_provider: self.voice_provider,
        })
    }
}

struct ChatConfigRow {
    agent_id: String,
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<i64>,
    system_prompt: Option<String>,
    conversation_hint: Option<String>,
    language: Option<String>,
}

impl ChatConfigRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            agent_id: row.try_get("agent_id")?,
            model: row.try_get("model")?,
            temperature: row.try_get("temperature")?,
            max_tokens: row.try_get("max_tokens")?,
            system_prompt: row.try_get("system_prompt")?,
            conversation_hint: row.try_get("conversation_hint")?,
            language: row.try_get("language")?,
        })
    }

    fn into_config(self) -> Result<PersonaChatConfig, RepositoryError> {
        Ok(PersonaChatConfig {
            agent_id: parse_uuid(&self.agent_id, "agent_id")?,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens.and_then(|n| u32::try_from(n).ok()),
            system_prompt: self.system_prompt,
            conversation_hint: self.conversation_hint,
            language: self.language,
        })
    }
}

fn unavailable(e: impl std::fmt::Display) -> PersonaError {
    PersonaError::Unavailable(e.to_string())
}

impl PersonaProvider for SqlitePersonaProvider {
    async fn get_persona(&self, agent_id: &Uuid) -> Result<Persona, PersonaError> {
        let row = sqlx::query("SELECT * FROM personas WHERE id = ?")
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(unavailable)?
            .ok_or(PersonaError::NotFound)?;

        PersonaRow::from_row(&row)
            .map_err(unavailable)?
            .into_persona()
            .map_err(unavailable)
    }

    async fn get_chat_config(
        &self,
        agent_id: &Uuid,
    ) -> Result<Option<PersonaChatConfig>, PersonaError> {
        let row = sqlx::query("SELECT * FROM persona_chat_configs WHERE agent_id = ?")
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(unavailable)?;

        match row {
            Some(ref r) => Ok(Some(
                ChatConfigRow::from_row(r)
                    .map_err(unavailable)?
                    .into_config()
                    .map_err(unavailable)?,
            )),
            None => Ok(None),
        }
    }
}
