//! Conversations removed by unmatch.
//!
//! The transport is at-least-once, so copies of already applied events may
//! still arrive after a removal. Removed ids are remembered (bounded, oldest
//! forgotten first) and persisted so late events cannot recreate the
//! conversation, across restarts included. A new `match.created` for the
//! same id lifts the tombstone.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreResult;
use crate::models::ConversationId;

/// Key/value entry holding the removed conversation ids, oldest first
pub const REMOVED_CONVERSATIONS_KEY: &str = "sync.removed_conversations";

/// Removed conversations remembered at most
pub const MAX_TOMBSTONES: usize = 512;

pub(crate) struct Tombstones {
    entries: DashMap<ConversationId, u64>,
    next_order: AtomicU64,
    capacity: usize,
}

impl Tombstones {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            next_order: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Restore from the persisted form produced by [`Tombstones::encode`]
    pub(crate) fn hydrate(&self, raw: &str) -> StoreResult<usize> {
        let ids: Vec<ConversationId> = serde_json::from_str(raw)?;
        for id in &ids {
            self.insert(*id);
        }
        Ok(ids.len())
    }

    pub(crate) fn contains(&self, conversation_id: ConversationId) -> bool {
        self.entries.contains_key(&conversation_id)
    }

    pub(crate) fn insert(&self, conversation_id: ConversationId) {
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(conversation_id, order);

        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| *entry.value())
                .map(|entry| *entry.key());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Returns true when a tombstone was lifted
    pub(crate) fn remove(&self, conversation_id: ConversationId) -> bool {
        self.entries.remove(&conversation_id).is_some()
    }

    /// JSON array of ids, oldest removal first
    pub(crate) fn encode(&self) -> StoreResult<String> {
        let mut ordered: Vec<(u64, ConversationId)> = self
            .entries
            .iter()
            .map(|entry| (*entry.value(), *entry.key()))
            .collect();
        ordered.sort_unstable_by_key(|(order, _)| *order);
        let ids: Vec<ConversationId> = ordered.into_iter().map(|(_, id)| id).collect();
        Ok(serde_json::to_string(&ids)?)
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
