//! SQLite chat repository implementation.
//!
//! Implements `ChatRepository` from `companion-core` using sqlx with split
//! read/write pools: raw queries, private Row structs, reads on the reader
//! pool and every mutation on the single-connection writer.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use companion_core::chat::repository::ChatRepository;
use companion_types::chat::{
    ChatMessage, Conversation, ConversationStatus, MessageCompletion, MessageExtras, MessageRole,
    NewMessage,
};
use companion_types::error::RepositoryError;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_err};

/// SQLite-backed implementation of `ChatRepository`.
pub struct SqliteChatRepository {
    pool: DatabasePool,
}

impl SqliteChatRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ConversationRow {
    id: String,
    agent_id: String,
    user_id: String,
    status: String,
    title: Option<String>,
    summary: Option<String>,
    summary_updated_at: Option<String>,
    summary_through_seq: Option<i64>,
    token_input_sum: i64,
    token_output_sum: i64,
    started_at: String,
    last_msg_at: String,
}

impl ConversationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            title: row.try_get("title")?,
            summary: row.try_get("summary")?,
            summary_updated_at: row.try_get("summary_updated_at")?,
            summary_through_seq: row.try_get("summary_through_seq")?,
            token_input_sum: row.try_get("token_input_sum")?,
            token_output_sum: row.try_get("token_output_sum")?,
            started_at: row.try_get("started_at")?,
            last_msg_at: row.try_get("last_msg_at")?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, RepositoryError> {
        let status: ConversationStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        Ok(Conversation {
            id: parse_uuid(&self.id, "conversation id")?,
            agent_id: parse_uuid(&self.agent_id, "agent_id")?,
            user_id: parse_uuid(&self.user_id, "user_id")?,
            status,
            title: self.title,
            summary: self.summary,
            summary_updated_at: self
                .summary_updated_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            summary_through_seq: self.summary_through_seq,
            token_input_sum: self.token_input_sum,
            token_output_sum: self.token_output_sum,
            started_at: parse_datetime(&self.started_at)?,
            last_msg_at: parse_datetime(&self.last_msg_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    content: String,
    parent_message_id: Option<String>,
    latency_ms: Option<i64>,
    token_input: Option<i64>,
    token_output: Option<i64>,
    err_code: Option<String>,
    err_msg: Option<String>,
    extras: String,
    created_at: String,
    updated_at: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            seq: row.try_get("seq")?,
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            parent_message_id: row.try_get("parent_message_id")?,
            latency_ms: row.try_get("latency_ms")?,
            token_input: row.try_get("token_input")?,
            token_output: row.try_get("token_output")?,
            err_code: row.try_get("err_code")?,
            err_msg: row.try_get("err_msg")?,
            extras: row.try_get("extras")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_message(self) -> Result<ChatMessage, RepositoryError> {
        let role: MessageRole = self
            .role
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        Ok(ChatMessage {
            id: parse_uuid(&self.id, "message id")?,
            conversation_id: parse_uuid(&self.conversation_id, "conversation_id")?,
            seq: self.seq,
            role,
            content: self.content,
            parent_message_id: self
                .parent_message_id
                .as_deref()
                .map(|s| parse_uuid(s, "parent_message_id"))
                .transpose()?,
            latency_ms: self.latency_ms,
            token_input: self.token_input,
            token_output: self.token_output,
            err_code: self.err_code,
            err_msg: self.err_msg,
            extras: MessageExtras::from_json_str(&self.extras),
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn map_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, RepositoryError> {
    ConversationRow::from_row(row)
        .map_err(query_err)?
        .into_conversation()
}

fn map_message(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage, RepositoryError> {
    MessageRow::from_row(row).map_err(query_err)?.into_message()
}

// ---------------------------------------------------------------------------
// ChatRepository implementation
// ---------------------------------------------------------------------------

impl ChatRepository for SqliteChatRepository {
    async fn find_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE agent_id = ? AND user_id = ?")
            .bind(agent_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(map_conversation).transpose()
    }

    async fn get_or_create_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Conversation, RepositoryError> {
        let fresh = Conversation::new(*agent_id, *user_id);
        sqlx::query(
            r#"INSERT INTO conversations (id, agent_id, user_id, status, started_at, last_msg_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT (agent_id, user_id) DO NOTHING"#,
        )
        .bind(fresh.id.to_string())
        .bind(agent_id.to_string())
        .bind(user_id.to_string())
        .bind(fresh.status.to_string())
        .bind(format_datetime(&fresh.started_at))
        .bind(format_datetime(&fresh.last_msg_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        // Read back on the writer so a concurrent creator's row is visible.
        let row = sqlx::query("SELECT * FROM conversations WHERE agent_id = ? AND user_id = ?")
            .bind(agent_id.to_string())
            .bind(user_id.to_string())
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_err)?;
        map_conversation(&row)
    }

    async fn get_conversation(
        &self,
        conversation_id: &Uuid,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(map_conversation).transpose()
    }

    async fn append_message(
        &self,
        conversation: &Conversation,
        message: NewMessage,
    ) -> Result<ChatMessage, RepositoryError> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let next: (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?")
                .bind(conversation.id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;
        let seq = next.0;

        sqlx::query(
            r#"INSERT INTO messages (id, conversation_id, seq, role, content, parent_message_id, extras, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(conversation.id.to_string())
        .bind(seq)
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(message.parent_message_id.map(|p| p.to_string()))
        .bind(message.extras.to_json_string())
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("seq {seq} already taken"))
            }
            _ => query_err(e),
        })?;

        let updated = sqlx::query("UPDATE conversations SET last_msg_at = ? WHERE id = ?")
            .bind(format_datetime(&now))
            .bind(conversation.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        tx.commit().await.map_err(query_err)?;

        Ok(ChatMessage {
            id,
            conversation_id: conversation.id,
            seq,
            role: message.role,
            content: message.content,
            parent_message_id: message.parent_message_id,
            latency_ms: None,
            token_input: None,
            token_output: None,
            err_code: None,
            err_msg: None,
            extras: message.extras,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_message_content(
        &self,
        message_id: &Uuid,
        content: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE messages SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(format_datetime(&Utc::now()))
            .bind(message_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn finalize_message(
        &self,
        _conversation: &Conversation,
        message_id: &Uuid,
        completion: &MessageCompletion,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE messages
               SET content = ?, latency_ms = ?, token_input = ?, token_output = ?,
                   err_code = ?, err_msg = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&completion.content)
        .bind(completion.latency_ms)
        .bind(completion.token_input)
        .bind(completion.token_output)
        .bind(&completion.err_code)
        .bind(&completion.err_msg)
        .bind(format_datetime(&Utc::now()))
        .bind(message_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn merge_message_extras(
        &self,
        message_id: &Uuid,
        patch: &MessageExtras,
    ) -> Result<MessageExtras, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let stored: Option<(String,)> = sqlx::query_as("SELECT extras FROM messages WHERE id = ?")
            .bind(message_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        let Some((raw,)) = stored else {
            return Err(RepositoryError::NotFound);
        };

        let mut extras = MessageExtras::from_json_str(&raw);
        extras.merge(patch);

        sqlx::query("UPDATE messages SET extras = ?, updated_at = ? WHERE id = ?")
            .bind(extras.to_json_string())
            .bind(format_datetime(&Utc::now()))
            .bind(message_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(extras)
    }

    async fn get_message(&self, message_id: &Uuid) -> Result<Option<ChatMessage>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(map_message).transpose()
    }

    async fn recent_messages(
        &self,
        conversation: &Conversation,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(conversation.id.to_string())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            messages.push(map_message(row)?);
        }
        Ok(messages)
    }

    async fn count_messages(&self, conversation_id: &Uuid) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.try_get("cnt").map_err(query_err)
    }

    async fn latest_seq(&self, conversation_id: &Uuid) -> Result<Option<i64>, RepositoryError> {
        let row = sqlx::query("SELECT MAX(seq) AS latest FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.try_get("latest").map_err(query_err)
    }

    async fn has_assistant_reply(&self, conversation_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT EXISTS(
                   SELECT 1 FROM messages
                   WHERE conversation_id = ? AND role = 'assistant' AND content != ''
               ) AS replied"#,
        )
        .bind(conversation_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_err)?;
        let replied: i64 = row.try_get("replied").map_err(query_err)?;
        Ok(replied != 0)
    }

    async fn add_conversation_tokens(
        &self,
        conversation_id: &Uuid,
        input: i64,
        output: i64,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE conversations
               SET token_input_sum = token_input_sum + ?, token_output_sum = token_output_sum + ?
               WHERE id = ?"#,
        )
        .bind(input.max(0))
        .bind(output.max(0))
        .bind(conversation_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_summary(
        &self,
        conversation_id: &Uuid,
        summary: &str,
        through_seq: i64,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE conversations
               SET summary = ?, summary_updated_at = ?, summary_through_seq = ?
               WHERE id = ?"#,
        )
        .bind(summary)
        .bind(format_datetime(&Utc::now()))
        .bind(through_seq)
        .bind(conversation_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sqlite::test_support::test_pool;

    async fn setup() -> (SqliteChatRepository, Conversation) {
        let repo = SqliteChatRepository::new(test_pool().await);
        let conv = repo
            .get_or_create_conversation(&Uuid::now_v7(), &Uuid::now_v7())
            .await
            .unwrap();
        (repo, conv)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let repo = SqliteChatRepository::new(test_pool().await);
        let (agent, user) = (Uuid::now_v7(), Uuid::now_v7());
        let first = repo.get_or_create_conversation(&agent, &user).await.unwrap();
        let second = repo.get_or_create_conversation(&agent, &user).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ConversationStatus::Active);

        let found = repo.find_conversation(&agent, &user).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(repo.find_conversation(&user, &agent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_assigns_gapless_seq_and_advances_last_msg_at() {
        let (repo, conv) = setup().await;
        let before = conv.last_msg_at;

        let user = repo.append_message(&conv, NewMessage::user("hi")).await.unwrap();
        let placeholder = repo
            .append_message(&conv, NewMessage::assistant_placeholder(user.id))
            .await
            .unwrap();
        assert_eq!(user.seq, 1);
        assert_eq!(placeholder.seq, 2);
        assert_eq!(placeholder.parent_message_id, Some(user.id));

        let stored = repo.get_conversation(&conv.id).await.unwrap().unwrap();
        assert!(stored.last_msg_at >= before);
        assert_eq!(repo.latest_seq(&conv.id).await.unwrap(), Some(2));
        assert_eq!(repo.count_messages(&conv.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_collide() {
        let (repo, conv) = setup().await;
        let repo = std::sync::Arc::new(repo);
        let mut handles = Vec::new();
        for i in 0..10 {
            let repo = repo.clone();
            let conv = conv.clone();
            handles.push(tokio::spawn(async move {
                repo.append_message(&conv, NewMessage::user(format!("m{i}")))
                    .await
                    .unwrap()
                    .seq
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort();
        assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_recent_messages_oldest_first_with_limit() {
        let (repo, conv) = setup().await;
        for i in 0..5 {
            repo.append_message(&conv, NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let recent = repo.recent_messages(&conv, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_finalize_and_assistant_reply_detection() {
        let (repo, conv) = setup().await;
        let user = repo.append_message(&conv, NewMessage::user("hi")).await.unwrap();
        let placeholder = repo
            .append_message(&conv, NewMessage::assistant_placeholder(user.id))
            .await
            .unwrap();
        assert!(!repo.has_assistant_reply(&conv.id).await.unwrap());

        repo.update_message_content(&placeholder.id, "Hel").await.unwrap();
        let completion = MessageCompletion {
            content: "Hello!".into(),
            latency_ms: Some(120),
            token_input: Some(30),
            token_output: Some(5),
            ..Default::default()
        };
        repo.finalize_message(&conv, &placeholder.id, &completion)
            .await
            .unwrap();

        let stored = repo.get_message(&placeholder.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hello!");
        assert_eq!(stored.latency_ms, Some(120));
        assert_eq!(stored.token_output, Some(5));
        assert!(repo.has_assistant_reply(&conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_extras_preserves_existing_keys() {
        let (repo, conv) = setup().await;
        let msg = repo.append_message(&conv, NewMessage::user("hi")).await.unwrap();

        let mut first = MessageExtras::new();
        first.insert("emotion", json!({"label": "happy"}));
        repo.merge_message_extras(&msg.id, &first).await.unwrap();

        let mut second = MessageExtras::new();
        second.insert("speech_status", json!("queued"));
        let merged = repo.merge_message_extras(&msg.id, &second).await.unwrap();

        assert!(merged.contains_key("emotion"));
        assert!(merged.contains_key("speech_status"));
        let stored = repo.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.extras, merged);
    }

    #[tokio::test]
    async fn test_merge_extras_unknown_message() {
        let (repo, _conv) = setup().await;
        let err = repo
            .merge_message_extras(&Uuid::now_v7(), &MessageExtras::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_tokens_and_summary() {
        let (repo, conv) = setup().await;
        repo.add_conversation_tokens(&conv.id, 40, 10).await.unwrap();
        repo.add_conversation_tokens(&conv.id, 5, -3).await.unwrap();
        repo.save_summary(&conv.id, "User likes tea.", 6).await.unwrap();

        let stored = repo.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.token_input_sum, 45);
        assert_eq!(stored.token_output_sum, 10);
        assert_eq!(stored.summary.as_deref(), Some("User likes tea."));
        assert_eq!(stored.summary_through_seq, Some(6));
        assert!(stored.summary_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_latest_seq_empty_conversation() {
        let (repo, conv) = setup().await;
        assert_eq!(repo.latest_seq(&conv.id).await.unwrap(), None);
        assert_eq!(repo.count_messages(&conv.id).await.unwrap(), 0);
    }
}
