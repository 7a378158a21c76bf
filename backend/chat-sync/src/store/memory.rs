use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::DurableStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{Conversation, ConversationId, Message};

#[derive(Default)]
struct Tables {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    cursors: HashMap<ConversationId, i64>,
    values: HashMap<String, String>,
}

/// Process-memory store for web sessions without durable storage and for tests.
///
/// Writes can be made to fail on demand to exercise the at-least-once
/// persistence path.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StoreError::Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store writes disabled".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let tables = self.tables.read().await;
        Ok(tables.conversations.values().cloned().collect())
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> StoreResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.conversations.remove(&conversation_id);
        tables.messages.remove(&conversation_id);
        tables.cursors.remove(&conversation_id);
        Ok(())
    }

    async fn load_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut messages = tables
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|m| m.sequence);
        Ok(messages)
    }

    async fn save_messages(
        &self,
        conversation_id: ConversationId,
        messages: &[Message],
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.messages.insert(conversation_id, messages.to_vec());
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "Memory store saved message window"
        );
        Ok(())
    }

    async fn load_cursors(&self) -> StoreResult<HashMap<ConversationId, i64>> {
        let tables = self.tables.read().await;
        Ok(tables.cursors.clone())
    }

    async fn save_cursor(
        &self,
        conversation_id: ConversationId,
        sequence: i64,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables
            .cursors
            .entry(conversation_id)
            .and_modify(|current| *current = (*current).max(sequence))
            .or_insert(sequence);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        let tables = self.tables.read().await;
        Ok(tables.values.get(key).cloned())
    }

    async fn put_value(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        *tables = Tables::default();
        Ok(())
    }
}
