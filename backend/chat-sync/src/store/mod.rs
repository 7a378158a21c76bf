//! Durable on-device store
//!
//! Three logical tables (`conversations`, `messages`, `cursors`) plus a small
//! key/value area, all keyed by conversation id. Only server-confirmed
//! messages are ever written here.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::StoreResult;
use crate::models::{Conversation, ConversationId, Message};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persistence interface used by the reconciler and session lifecycle
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Load every stored conversation
    async fn load_conversations(&self) -> StoreResult<Vec<Conversation>>;

    /// Insert or replace a conversation row
    async fn upsert_conversation(&self, conversation: &Conversation) -> StoreResult<()>;

    /// Delete a conversation together with its messages and cursor
    async fn delete_conversation(&self, conversation_id: ConversationId) -> StoreResult<()>;

    /// Load the retained message window, ordered by sequence
    async fn load_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>>;

    /// Replace the retained message window of a conversation
    async fn save_messages(
        &self,
        conversation_id: ConversationId,
        messages: &[Message],
    ) -> StoreResult<()>;

    /// Load all cursors
    async fn load_cursors(&self) -> StoreResult<HashMap<ConversationId, i64>>;

    /// Store the last applied sequence of a conversation
    async fn save_cursor(&self, conversation_id: ConversationId, sequence: i64)
        -> StoreResult<()>;

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>>;

    async fn put_value(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Wipe everything (logout)
    async fn clear(&self) -> StoreResult<()>;
}

/// Keep only the most recent `window` confirmed records, ordered by sequence.
///
/// Provisional records are never part of the durable window.
pub fn retention_window(messages: &[Message], window: usize) -> Vec<Message> {
    let mut confirmed: Vec<Message> = messages
        .iter()
        .filter(|m| !m.is_provisional())
        .cloned()
        .collect();
    confirmed.sort_by_key(|m| m.sequence);
    if confirmed.len() > window {
        confirmed.drain(..confirmed.len() - window);
    }
    confirmed
}
