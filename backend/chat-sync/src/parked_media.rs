//! Media updates that arrived before the message carrying the media.
//!
//! Media events are unsequenced and may overtake their `message.new`. They
//! are held here by media id and merged into the message once it arrives.
//! The holding area is bounded; the oldest entry is evicted first.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use event_schema::{MediaReadyEvent, ReceiverStatus};

use crate::models::{ConversationId, MediaDescriptor};

/// Distinct media ids held at most
pub const MAX_PARKED_MEDIA: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MediaUpdate {
    Decision(ReceiverStatus),
    Ready(MediaReadyEvent),
}

impl MediaUpdate {
    pub(crate) fn apply(&self, media: &mut MediaDescriptor) {
        match self {
            MediaUpdate::Decision(status) => media.apply_decision(*status),
            MediaUpdate::Ready(ready) => media.merge_ready(ready),
        }
    }
}

struct Parked {
    conversation_id: ConversationId,
    order: u64,
    updates: Vec<MediaUpdate>,
}

pub(crate) struct ParkedMedia {
    entries: DashMap<String, Parked>,
    next_order: AtomicU64,
    capacity: usize,
}

impl ParkedMedia {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            next_order: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Hold an update in arrival order. Returns the media ids evicted to
    /// stay within capacity.
    pub(crate) fn park(
        &self,
        media_id: &str,
        conversation_id: ConversationId,
        update: MediaUpdate,
    ) -> Vec<String> {
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        self.entries
            .entry(media_id.to_string())
            .or_insert_with(|| Parked {
                conversation_id,
                order,
                updates: Vec::new(),
            })
            .updates
            .push(update);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().order)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }

    /// Remove and return everything held for a media id
    pub(crate) fn take(&self, media_id: &str) -> Vec<MediaUpdate> {
        self.entries
            .remove(media_id)
            .map(|(_, parked)| parked.updates)
            .unwrap_or_default()
    }

    pub(crate) fn discard_conversation(&self, conversation_id: ConversationId) {
        self.entries
            .retain(|_, parked| parked.conversation_id != conversation_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
