//! Aggregate unread counters
//!
//! Per-conversation unread counts plus a running total. Every transition
//! adjusts the total by the same delta inside the entry lock, so the total
//! is never recomputed by summing.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::ConversationId;

#[derive(Default)]
pub struct UnreadCounters {
    per_conversation: DashMap<ConversationId, u32>,
    total: AtomicU64,
}

impl UnreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new count
    pub fn increment(&self, conversation_id: ConversationId) -> u32 {
        let mut entry = self.per_conversation.entry(conversation_id).or_insert(0);
        *entry = entry.saturating_add(1);
        self.total.fetch_add(1, Ordering::SeqCst);
        *entry
    }

    /// Floors at zero; returns the new count
    pub fn decrement(&self, conversation_id: ConversationId) -> u32 {
        let mut entry = self.per_conversation.entry(conversation_id).or_insert(0);
        if *entry > 0 {
            *entry -= 1;
            self.total.fetch_sub(1, Ordering::SeqCst);
        }
        *entry
    }

    /// Returns the count before the reset
    pub fn reset(&self, conversation_id: ConversationId) -> u32 {
        let mut entry = self.per_conversation.entry(conversation_id).or_insert(0);
        let previous = *entry;
        *entry = 0;
        self.total.fetch_sub(previous as u64, Ordering::SeqCst);
        previous
    }

    /// Overwrite a count from durable state (startup, match.created)
    pub fn seed(&self, conversation_id: ConversationId, count: u32) {
        let mut entry = self.per_conversation.entry(conversation_id).or_insert(0);
        let previous = *entry;
        *entry = count;
        if count >= previous {
            self.total.fetch_add((count - previous) as u64, Ordering::SeqCst);
        } else {
            self.total.fetch_sub((previous - count) as u64, Ordering::SeqCst);
        }
    }

    pub fn remove(&self, conversation_id: ConversationId) -> u32 {
        match self.per_conversation.remove(&conversation_id) {
            Some((_, count)) => {
                self.total.fetch_sub(count as u64, Ordering::SeqCst);
                count
            }
            None => 0,
        }
    }

    pub fn get(&self, conversation_id: ConversationId) -> u32 {
        self.per_conversation
            .get(&conversation_id)
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.per_conversation.clear();
        self.total.store(0, Ordering::SeqCst);
    }
}
