use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use event_schema::MessageKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::DurableStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{Conversation, ConversationId, MediaDescriptor, Message, SendState};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        participant_ids TEXT NOT NULL,
        last_message TEXT,
        last_message_at_ms INTEGER,
        unread_count INTEGER NOT NULL DEFAULT 0,
        compatibility_score REAL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        conversation_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT,
        media TEXT,
        delivered INTEGER NOT NULL DEFAULT 0,
        is_read INTEGER NOT NULL DEFAULT 0,
        created_at_ms INTEGER NOT NULL,
        PRIMARY KEY (conversation_id, sequence)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_id ON messages (id)",
    r#"
    CREATE TABLE IF NOT EXISTS cursors (
        conversation_id TEXT PRIMARY KEY,
        last_applied_sequence INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

/// SQLite-backed on-device store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    ///
    /// In-memory URLs get a single long-lived connection, otherwise every
    /// pooled connection would see its own empty database.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, in_memory = in_memory, "SQLite store ready");
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
        Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("uuid {raw}: {e}")))
    }

    fn parse_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}")))
    }

    fn conversation_from_row(row: &SqliteRow) -> StoreResult<Conversation> {
        let id: String = row.try_get("id")?;
        let participants: String = row.try_get("participant_ids")?;
        let last_message_at_ms: Option<i64> = row.try_get("last_message_at_ms")?;
        let unread_count: i64 = row.try_get("unread_count")?;
        let compatibility_score: Option<f64> = row.try_get("compatibility_score")?;

        Ok(Conversation {
            id: Self::parse_uuid(&id)?,
            participant_ids: serde_json::from_str(&participants)?,
            last_message: row.try_get("last_message")?,
            last_message_at: last_message_at_ms.map(Self::parse_millis).transpose()?,
            unread_count: u32::try_from(unread_count).unwrap_or(0),
            compatibility_score: compatibility_score.map(|s| s as f32),
        })
    }

    fn message_from_row(conversation_id: ConversationId, row: &SqliteRow) -> StoreResult<Message> {
        let sender_id: String = row.try_get("sender_id")?;
        let kind: String = row.try_get("kind")?;
        let media: Option<String> = row.try_get("media")?;
        let delivered: i64 = row.try_get("delivered")?;
        let is_read: i64 = row.try_get("is_read")?;
        let created_at_ms: i64 = row.try_get("created_at_ms")?;

        Ok(Message {
            id: row.try_get("id")?,
            sequence: row.try_get("sequence")?,
            conversation_id,
            sender_id: Self::parse_uuid(&sender_id)?,
            kind: MessageKind::parse(&kind)
                .ok_or_else(|| StoreError::Corrupt(format!("message kind {kind}")))?,
            content: row.try_get("content")?,
            media: media
                .map(|raw| serde_json::from_str::<MediaDescriptor>(&raw))
                .transpose()?,
            delivered: delivered != 0,
            read: is_read != 0,
            created_at: Self::parse_millis(created_at_ms)?,
            send_state: SendState::Confirmed,
        })
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn load_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, participant_ids, last_message, last_message_at_ms,
                   unread_count, compatibility_score
            FROM conversations
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::conversation_from_row).collect()
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let participants = serde_json::to_string(&conversation.participant_ids)?;

        sqlx::query(
            r#"
            INSERT INTO conversations (
                id, participant_ids, last_message, last_message_at_ms,
                unread_count, compatibility_score
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO UPDATE SET
                participant_ids = excluded.participant_ids,
                last_message = excluded.last_message,
                last_message_at_ms = excluded.last_message_at_ms,
                unread_count = excluded.unread_count,
                compatibility_score = excluded.compatibility_score
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(participants)
        .bind(conversation.last_message.as_deref())
        .bind(conversation.last_message_at.map(|at| at.timestamp_millis()))
        .bind(i64::from(conversation.unread_count))
        .bind(conversation.compatibility_score.map(f64::from))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> StoreResult<()> {
        let id = conversation_id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cursors WHERE conversation_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(conversation_id = %conversation_id, "Deleted conversation");
        Ok(())
    }

    async fn load_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, id, sender_id, kind, content, media,
                   delivered, is_read, created_at_ms
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY sequence ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::message_from_row(conversation_id, row))
            .collect()
    }

    async fn save_messages(
        &self,
        conversation_id: ConversationId,
        messages: &[Message],
    ) -> StoreResult<()> {
        let id = conversation_id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        for message in messages.iter().filter(|m| !m.is_provisional()) {
            let media = message
                .media
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO messages (
                    conversation_id, sequence, id, sender_id, kind, content,
                    media, delivered, is_read, created_at_ms
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(&id)
            .bind(message.sequence)
            .bind(&message.id)
            .bind(message.sender_id.to_string())
            .bind(message.kind.as_str())
            .bind(message.content.as_deref())
            .bind(media)
            .bind(message.delivered)
            .bind(message.read)
            .bind(message.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "Saved message window"
        );
        Ok(())
    }

    async fn load_cursors(&self) -> StoreResult<HashMap<ConversationId, i64>> {
        let rows = sqlx::query("SELECT conversation_id, last_applied_sequence FROM cursors")
            .fetch_all(&self.pool)
            .await?;

        let mut cursors = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("conversation_id")?;
            let sequence: i64 = row.try_get("last_applied_sequence")?;
            cursors.insert(Self::parse_uuid(&id)?, sequence);
        }
        Ok(cursors)
    }

    async fn save_cursor(
        &self,
        conversation_id: ConversationId,
        sequence: i64,
    ) -> StoreResult<()> {
        // MAX() keeps the stored cursor monotonic even if writes race
        sqlx::query(
            r#"
            INSERT INTO cursors (conversation_id, last_applied_sequence)
            VALUES (?1, ?2)
            ON CONFLICT (conversation_id) DO UPDATE SET
                last_applied_sequence = MAX(cursors.last_applied_sequence, excluded.last_applied_sequence)
            "#,
        )
        .bind(conversation_id.to_string())
        .bind(sequence)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_value(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["messages", "cursors", "conversations", "kv"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!("SQLite store cleared");
        Ok(())
    }
}
