//! Event reconciler
//!
//! Sole mutator of conversation and message state in response to inbound
//! push events. Each sequenced event is checked against the conversation
//! cursor, merged into the projection, written through to the durable store
//! and folded into the unread counters.
//!
//! Handling of one conversation is serialized by a per-conversation async
//! mutex held across the durable write; different conversations interleave
//! freely.
//!
//! Durable write failures are not rolled back. The projection stays
//! authoritative for the live session and the next successful write carries
//! the full state (at-least-once persistence).

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use event_schema::{
    ConversationSnapshot, MediaDecisionEvent, MediaReadyEvent, MessageDeliveredEvent,
    MessageReadEvent, NewMessageEvent, PushEvent, ReceiverStatus,
};

use crate::counters::UnreadCounters;
use crate::cursor::CursorTracker;
use crate::error::StoreResult;
use crate::metrics::{
    self, SYNC_DUPLICATES_DROPPED, SYNC_MEDIA_PARKED, SYNC_PERSIST_FAILURES,
    SYNC_UNMATCHED_MEDIA,
};
use crate::models::{Conversation, ConversationId, MediaDescriptor, Message, UserId};
use crate::parked_media::{MediaUpdate, ParkedMedia, MAX_PARKED_MEDIA};
use crate::projection::QueryCache;
use crate::store::{retention_window, DurableStore};
use crate::tombstones::{Tombstones, MAX_TOMBSTONES, REMOVED_CONVERSATIONS_KEY};

/// Result of applying one event; never an error towards the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Projection and durable store updated
    Applied,
    /// Projection updated, a durable write failed
    AppliedNotPersisted,
    /// Sequence already applied; nothing changed
    Duplicate,
    /// The referenced message or media is not in the local projection
    Unmatched,
    /// Projection-only event (typing)
    Transient,
    /// Media update held until the message carrying the media arrives
    Deferred,
    /// Malformed event, dropped
    Invalid,
}

impl ApplyOutcome {
    fn from_persisted(persisted: bool) -> Self {
        if persisted {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::AppliedNotPersisted
        }
    }

    /// Whether the projection changed
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Applied | ApplyOutcome::AppliedNotPersisted | ApplyOutcome::Transient
        )
    }
}

/// Which end of the history a fetched page belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Newest page of a conversation (cold load)
    Latest,
    /// Page before the oldest retained message
    Older,
}

/// Insert a confirmed record in sequence order, replacing any record with
/// the same sequence or id. Provisional records stay at the tail.
fn insert_confirmed(list: &mut Vec<Message>, message: Message) {
    list.retain(|m| {
        m.is_provisional() || (m.sequence != message.sequence && m.id != message.id)
    });
    let position = list
        .iter()
        .position(|m| m.is_provisional() || m.sequence > message.sequence)
        .unwrap_or(list.len());
    list.insert(position, message);
}

pub struct EventReconciler {
    local_user: UserId,
    cache: Arc<QueryCache>,
    store: Arc<dyn DurableStore>,
    cursors: CursorTracker,
    counters: UnreadCounters,
    retention_window: usize,
    parked_media: ParkedMedia,
    tombstones: Tombstones,
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl EventReconciler {
    pub fn new(
        local_user: UserId,
        cache: Arc<QueryCache>,
        store: Arc<dyn DurableStore>,
        retention_window: usize,
    ) -> Self {
        Self {
            local_user,
            cache,
            cursors: CursorTracker::new(store.clone()),
            store,
            counters: UnreadCounters::new(),
            retention_window,
            parked_media: ParkedMedia::new(MAX_PARKED_MEDIA),
            tombstones: Tombstones::new(MAX_TOMBSTONES),
            locks: DashMap::new(),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Last applied sequence of a conversation
    pub fn cursor(&self, conversation_id: ConversationId) -> Option<i64> {
        self.cursors.get_cursor(conversation_id)
    }

    pub fn unread(&self, conversation_id: ConversationId) -> u32 {
        self.counters.get(conversation_id)
    }

    pub fn unread_total(&self) -> u64 {
        self.counters.total()
    }

    /// Load conversations, messages, cursors and counters from the durable
    /// store into memory. Returns the number of conversations restored.
    pub async fn rehydrate(&self) -> StoreResult<usize> {
        if let Some(raw) = self.store.get_value(REMOVED_CONVERSATIONS_KEY).await? {
            match self.tombstones.hydrate(&raw) {
                Ok(count) => debug!(removed = count, "Restored removed conversations"),
                Err(e) => warn!(error = %e, "Ignoring unreadable removed-conversation list"),
            }
        }

        let conversations: Vec<Conversation> = self
            .store
            .load_conversations()
            .await?
            .into_iter()
            .filter(|c| !self.tombstones.contains(c.id))
            .collect();
        let mut cursors = self.store.load_cursors().await?;
        cursors.retain(|id, _| !self.tombstones.contains(*id));

        let mut conversation_ids: Vec<ConversationId> =
            conversations.iter().map(|c| c.id).collect();
        for id in cursors.keys() {
            if !conversation_ids.contains(id) {
                conversation_ids.push(*id);
            }
        }

        self.cursors.hydrate(cursors);
        for conversation in conversations {
            self.counters
                .seed(conversation.id, conversation.unread_count);
            self.cache.upsert_conversation(conversation);
        }

        for conversation_id in &conversation_ids {
            let messages = self.store.load_messages(*conversation_id).await?;
            let Some(max_sequence) = messages.iter().map(|m| m.sequence).max() else {
                continue;
            };
            // a window saved ahead of a failed cursor write still counts as applied
            self.cursors.raise(*conversation_id, max_sequence);
            self.cursors.hydrate_gaps(*conversation_id, &messages);
            self.cache
                .update_messages(*conversation_id, |list| *list = messages);
        }

        self.cache.set_unread_total(self.counters.total());
        Ok(conversation_ids.len())
    }

    /// Apply one inbound push event
    pub async fn apply(&self, event: PushEvent) -> ApplyOutcome {
        let event_type = event.event_type();

        let outcome = match event {
            PushEvent::MessageNew(e) => self.apply_new_message(e).await,
            PushEvent::MessageRead(e) => self.apply_read(e).await,
            PushEvent::MessageDelivered(e) => self.apply_delivered(e).await,
            PushEvent::MediaAccepted(e) => {
                self.apply_media_decision(e, ReceiverStatus::Accepted).await
            }
            PushEvent::MediaRejected(e) => {
                self.apply_media_decision(e, ReceiverStatus::Rejected).await
            }
            PushEvent::MediaReady(e) => self.apply_media_ready(e).await,
            PushEvent::Typing(e) => {
                self.cache.set_typing(e.user_id, e.is_typing);
                ApplyOutcome::Transient
            }
            PushEvent::MatchCreated(snapshot) => self.apply_match_created(snapshot).await,
            PushEvent::MatchRemoved(e) => self.remove_conversation(e.conversation_id).await,
        };

        if outcome.is_applied() {
            metrics::record_applied(event_type);
        }
        outcome
    }

    async fn apply_new_message(&self, event: NewMessageEvent) -> ApplyOutcome {
        let conversation_id = event.conversation_id;
        if event.sequence <= 0 {
            warn!(
                conversation_id = %conversation_id,
                message_id = %event.id,
                sequence = event.sequence,
                "Dropping message.new without a server sequence"
            );
            return ApplyOutcome::Invalid;
        }

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        if self.tombstones.contains(conversation_id) {
            SYNC_DUPLICATES_DROPPED.inc();
            debug!(
                conversation_id = %conversation_id,
                sequence = event.sequence,
                "message.new for removed conversation, dropping"
            );
            return ApplyOutcome::Duplicate;
        }
        if !self.cursors.admit(conversation_id, event.sequence).is_accepted() {
            SYNC_DUPLICATES_DROPPED.inc();
            return ApplyOutcome::Duplicate;
        }

        let mut message = Message::from(event);
        self.apply_parked_media(&mut message);
        let from_local_user = message.sender_id == self.local_user;

        let superseded = self.cache.update_messages(conversation_id, |list| {
            let before = list.len();
            if from_local_user {
                list.retain(|m| !m.is_provisional());
            }
            let superseded = before - list.len();
            insert_confirmed(list, message.clone());
            superseded
        });
        if superseded > 0 {
            debug!(
                conversation_id = %conversation_id,
                sequence = message.sequence,
                superseded = superseded,
                "Confirmed echo replaced provisional records"
            );
        }

        let mut persisted = self.persist_messages(conversation_id).await;
        persisted &= self.persist_cursor(conversation_id).await;

        let unread = if from_local_user {
            self.counters.get(conversation_id)
        } else {
            self.counters.increment(conversation_id)
        };

        let mut conversation = match self.cache.conversation(conversation_id) {
            Some(conversation) => conversation,
            None => {
                debug!(
                    conversation_id = %conversation_id,
                    "Message for unknown conversation, creating placeholder"
                );
                Conversation::placeholder(
                    conversation_id,
                    &[self.local_user, message.sender_id],
                )
            }
        };
        conversation.apply_preview(&message);
        conversation.unread_count = unread;

        self.cache.upsert_conversation(conversation.clone());
        self.cache.set_unread_total(self.counters.total());
        persisted &= self.persist_conversation(&conversation).await;

        ApplyOutcome::from_persisted(persisted)
    }

    async fn apply_read(&self, event: MessageReadEvent) -> ApplyOutcome {
        let conversation_id = event.conversation_id;
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        if event.reader_id == self.local_user {
            let cleared = self.counters.reset(conversation_id);
            self.cache.set_unread_total(self.counters.total());
            debug!(
                conversation_id = %conversation_id,
                cleared = cleared,
                "Unread reset by local read"
            );

            let updated = self.cache.update_conversation(conversation_id, |c| {
                c.unread_count = 0;
                c.clone()
            });
            return match updated {
                Some(conversation) => {
                    ApplyOutcome::from_persisted(self.persist_conversation(&conversation).await)
                }
                None => ApplyOutcome::Applied,
            };
        }

        let local_user = self.local_user;
        let marked = self
            .cache
            .update_existing_messages(conversation_id, |list| {
                let mut marked = 0usize;
                for message in list
                    .iter_mut()
                    .filter(|m| m.sender_id == local_user && !m.is_provisional() && !m.read)
                {
                    message.read = true;
                    marked += 1;
                }
                marked
            })
            .unwrap_or(0);

        if marked == 0 {
            return ApplyOutcome::Applied;
        }
        ApplyOutcome::from_persisted(self.persist_messages(conversation_id).await)
    }

    async fn apply_delivered(&self, event: MessageDeliveredEvent) -> ApplyOutcome {
        let Some(conversation_id) = self.cache.find_message_conversation(&event.message_id)
        else {
            debug!(message_id = %event.message_id, "message.delivered for unknown message");
            return ApplyOutcome::Unmatched;
        };

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        let changed = self
            .cache
            .update_existing_messages(conversation_id, |list| {
                list.iter_mut()
                    .find(|m| m.id == event.message_id)
                    .map(|m| !std::mem::replace(&mut m.delivered, true))
            })
            .flatten();

        match changed {
            None => ApplyOutcome::Unmatched,
            Some(false) => ApplyOutcome::Applied,
            Some(true) => {
                ApplyOutcome::from_persisted(self.persist_messages(conversation_id).await)
            }
        }
    }

    async fn apply_media_decision(
        &self,
        event: MediaDecisionEvent,
        status: ReceiverStatus,
    ) -> ApplyOutcome {
        debug!(
            media_id = %event.media_id,
            actor_id = %event.actor_id,
            status = ?status,
            "Media decision"
        );
        self.apply_media_update(
            &event.media_id,
            event.conversation_id,
            MediaUpdate::Decision(status),
        )
        .await
    }

    async fn apply_media_ready(&self, event: MediaReadyEvent) -> ApplyOutcome {
        let media_id = event.media_id.clone();
        let conversation_id = event.conversation_id;
        self.apply_media_update(&media_id, conversation_id, MediaUpdate::Ready(event))
            .await
    }

    /// Locally consume a media item (one-time photos lose their url)
    pub(crate) async fn apply_local_view(&self, media_id: &str) -> ApplyOutcome {
        let Some(conversation_id) = self.cache.find_media_conversation(media_id, None) else {
            debug!(media_id = %media_id, "View of unknown media");
            return ApplyOutcome::Unmatched;
        };

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        let merged = self
            .merge_media(media_id, conversation_id, |media| {
                media.mark_viewed();
            })
            .await;
        merged.unwrap_or(ApplyOutcome::Unmatched)
    }

    /// Media events are unsequenced and matched by media id. An update for
    /// media no local message holds yet is parked until the message arrives.
    async fn apply_media_update(
        &self,
        media_id: &str,
        conversation_hint: ConversationId,
        update: MediaUpdate,
    ) -> ApplyOutcome {
        let conversation_id = self
            .cache
            .find_media_conversation(media_id, Some(conversation_hint))
            .unwrap_or(conversation_hint);

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        if self.tombstones.contains(conversation_id) {
            debug!(
                media_id = %media_id,
                conversation_id = %conversation_id,
                "Media event for removed conversation, dropping"
            );
            return ApplyOutcome::Unmatched;
        }

        let merged = self
            .merge_media(media_id, conversation_id, |media| update.apply(media))
            .await;
        match merged {
            Some(outcome) => outcome,
            None => self.park_media(media_id, conversation_id, update),
        }
    }

    /// Merge into media already in the projection; `None` when no message of
    /// the conversation holds it. The caller holds the conversation lock.
    async fn merge_media(
        &self,
        media_id: &str,
        conversation_id: ConversationId,
        f: impl FnOnce(&mut MediaDescriptor),
    ) -> Option<ApplyOutcome> {
        let found = self
            .cache
            .update_existing_messages(conversation_id, |list| {
                list.iter_mut()
                    .filter_map(|m| m.media.as_mut())
                    .find(|media| media.id == media_id)
                    .map(f)
                    .is_some()
            })
            .unwrap_or(false);

        if !found {
            return None;
        }
        Some(ApplyOutcome::from_persisted(
            self.persist_messages(conversation_id).await,
        ))
    }

    fn park_media(
        &self,
        media_id: &str,
        conversation_id: ConversationId,
        update: MediaUpdate,
    ) -> ApplyOutcome {
        let evicted = self.parked_media.park(media_id, conversation_id, update);
        SYNC_MEDIA_PARKED.inc();
        debug!(
            media_id = %media_id,
            conversation_id = %conversation_id,
            parked = self.parked_media.len(),
            "Media update parked until its message arrives"
        );

        for dropped in evicted {
            SYNC_UNMATCHED_MEDIA.inc();
            warn!(
                media_id = %dropped,
                "Parked media update never matched a local message, dropping"
            );
        }
        ApplyOutcome::Deferred
    }

    /// Fold updates that overtook this message into its media
    fn apply_parked_media(&self, message: &mut Message) {
        let Some(media) = message.media.as_mut() else {
            return;
        };
        let updates = self.parked_media.take(&media.id);
        if updates.is_empty() {
            return;
        }
        for update in &updates {
            update.apply(media);
        }
        debug!(
            media_id = %media.id,
            applied = updates.len(),
            "Applied parked media updates"
        );
    }

    async fn apply_match_created(&self, snapshot: ConversationSnapshot) -> ApplyOutcome {
        let mut conversation = Conversation::from(snapshot);
        let conversation_id = conversation.id;

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        let mut persisted = true;
        if self.tombstones.remove(conversation_id) {
            info!(conversation_id = %conversation_id, "Removed conversation matched again");
            persisted &= self.persist_tombstones(conversation_id).await;
        }

        if let Some(existing) = self.cache.conversation(conversation_id) {
            if existing.last_message_at > conversation.last_message_at {
                conversation.last_message = existing.last_message;
                conversation.last_message_at = existing.last_message_at;
            }
        }

        self.counters
            .seed(conversation_id, conversation.unread_count);
        self.cache.upsert_conversation(conversation.clone());
        self.cache.set_unread_total(self.counters.total());

        info!(conversation_id = %conversation_id, "Match created");
        persisted &= self.persist_conversation(&conversation).await;
        ApplyOutcome::from_persisted(persisted)
    }

    /// Remove a conversation from projection, counters, cursors and store.
    ///
    /// The id is tombstoned so redelivered events cannot recreate it. The
    /// conversation lock entry is kept; tasks already queued on it still
    /// serialize against later events.
    pub(crate) async fn remove_conversation(&self, conversation_id: ConversationId) -> ApplyOutcome {
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        self.tombstones.insert(conversation_id);
        let existed = self.cache.remove_conversation(conversation_id);
        self.counters.remove(conversation_id);
        self.cursors.remove(conversation_id);
        self.parked_media.discard_conversation(conversation_id);
        self.cache.set_unread_total(self.counters.total());

        let result = self.store.delete_conversation(conversation_id).await;
        let mut persisted = self.check_persisted(result, conversation_id, "conversations");
        persisted &= self.persist_tombstones(conversation_id).await;

        info!(
            conversation_id = %conversation_id,
            existed = existed,
            "Conversation removed"
        );
        ApplyOutcome::from_persisted(persisted)
    }

    /// Merge a page fetched over the history interface.
    ///
    /// Records whose sequence is already present are skipped. A latest page
    /// also advances the cursor and the conversation preview.
    pub(crate) async fn apply_history_page(
        &self,
        conversation_id: ConversationId,
        page: Vec<NewMessageEvent>,
        kind: PageKind,
    ) -> ApplyOutcome {
        let messages: Vec<Message> = page
            .into_iter()
            .filter(|e| {
                let valid = e.conversation_id == conversation_id && e.sequence > 0;
                if !valid {
                    warn!(
                        conversation_id = %conversation_id,
                        message_id = %e.id,
                        "Skipping history record for another conversation or without sequence"
                    );
                }
                valid
            })
            .map(Message::from)
            .collect();
        if messages.is_empty() {
            return ApplyOutcome::Applied;
        }

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        if self.tombstones.contains(conversation_id) {
            debug!(
                conversation_id = %conversation_id,
                "History page for removed conversation, dropping"
            );
            return ApplyOutcome::Unmatched;
        }

        for message in &messages {
            self.cursors.admit(conversation_id, message.sequence);
        }

        let newest = messages.iter().max_by_key(|m| m.sequence).cloned();
        let mut senders: Vec<UserId> = vec![self.local_user];
        senders.extend(messages.iter().map(|m| m.sender_id));

        let fetched = messages.len();
        let inserted = self.cache.update_messages(conversation_id, |list| {
            let mut inserted = 0usize;
            for mut message in messages {
                let present = list
                    .iter()
                    .any(|m| !m.is_provisional() && m.sequence == message.sequence);
                if !present {
                    self.apply_parked_media(&mut message);
                    insert_confirmed(list, message);
                    inserted += 1;
                }
            }
            inserted
        });

        debug!(
            conversation_id = %conversation_id,
            page = ?kind,
            fetched = fetched,
            inserted = inserted,
            "History page merged"
        );

        let mut persisted = self.persist_messages(conversation_id).await;
        persisted &= self.persist_cursor(conversation_id).await;

        if let (PageKind::Latest, Some(newest)) = (kind, newest) {
            let mut conversation = self
                .cache
                .conversation(conversation_id)
                .unwrap_or_else(|| Conversation::placeholder(conversation_id, &senders));
            if conversation.apply_preview(&newest) {
                self.cache.upsert_conversation(conversation.clone());
                persisted &= self.persist_conversation(&conversation).await;
            }
        }

        ApplyOutcome::from_persisted(persisted)
    }

    /// Drop all in-memory state (logout)
    pub(crate) fn reset(&self) {
        self.cache.clear();
        self.counters.clear();
        self.cursors.clear();
        self.parked_media.clear();
        self.tombstones.clear();
        self.locks.clear();
    }

    fn conversation_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        self.locks.entry(conversation_id).or_default().clone()
    }

    async fn persist_messages(&self, conversation_id: ConversationId) -> bool {
        let window = retention_window(&self.cache.messages(conversation_id), self.retention_window);
        let result = self.store.save_messages(conversation_id, &window).await;
        self.check_persisted(result, conversation_id, "messages")
    }

    async fn persist_cursor(&self, conversation_id: ConversationId) -> bool {
        let result = self.cursors.persist(conversation_id).await;
        self.check_persisted(result, conversation_id, "cursors")
    }

    async fn persist_tombstones(&self, conversation_id: ConversationId) -> bool {
        let result = match self.tombstones.encode() {
            Ok(raw) => self.store.put_value(REMOVED_CONVERSATIONS_KEY, &raw).await,
            Err(e) => Err(e),
        };
        self.check_persisted(result, conversation_id, "kv")
    }

    async fn persist_conversation(&self, conversation: &Conversation) -> bool {
        let result = self.store.upsert_conversation(conversation).await;
        self.check_persisted(result, conversation.id, "conversations")
    }

    fn check_persisted(
        &self,
        result: StoreResult<()>,
        conversation_id: ConversationId,
        table: &'static str,
    ) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                SYNC_PERSIST_FAILURES.inc();
                warn!(
                    conversation_id = %conversation_id,
                    table = table,
                    error = %e,
                    "Durable write failed, keeping projection state"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SendState;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use event_schema::{
        MediaRef, MessageKind, ProcessingStatus, TypingEvent, ViewMode,
    };
    use uuid::Uuid;

    struct Fixture {
        reconciler: EventReconciler,
        cache: Arc<QueryCache>,
        store: Arc<MemoryStore>,
        me: UserId,
        peer: UserId,
        conversation_id: ConversationId,
    }

    fn fixture(retention_window: usize) -> Fixture {
        let cache = Arc::new(QueryCache::new());
        let store = Arc::new(MemoryStore::new());
        let me = Uuid::new_v4();
        Fixture {
            reconciler: EventReconciler::new(me, cache.clone(), store.clone(), retention_window),
            cache,
            store,
            me,
            peer: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
        }
    }

    fn new_message(f: &Fixture, sequence: i64, sender: UserId) -> NewMessageEvent {
        NewMessageEvent {
            id: format!("m-{}", sequence),
            sequence,
            conversation_id: f.conversation_id,
            sender_id: sender,
            kind: MessageKind::Text,
            content: Some(format!("hello {}", sequence)),
            media_ref: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
                + Duration::seconds(sequence),
            delivered: false,
            read: false,
        }
    }

    fn provisional(f: &Fixture, marker: i64) -> Message {
        Message {
            id: format!("local-{}", marker),
            sequence: marker,
            conversation_id: f.conversation_id,
            sender_id: f.me,
            kind: MessageKind::Text,
            content: Some("pending".to_string()),
            media: None,
            delivered: false,
            read: false,
            created_at: Utc::now(),
            send_state: SendState::Pending,
        }
    }

    fn sequences(cache: &QueryCache, id: ConversationId) -> Vec<i64> {
        cache.messages(id).iter().map(|m| m.sequence).collect()
    }

    #[tokio::test]
    async fn test_replayed_message_counts_once() {
        let f = fixture(50);
        let event = PushEvent::MessageNew(new_message(&f, 1, f.peer));

        assert_eq!(f.reconciler.apply(event.clone()).await, ApplyOutcome::Applied);
        assert_eq!(f.reconciler.apply(event).await, ApplyOutcome::Duplicate);

        assert_eq!(f.cache.messages(f.conversation_id).len(), 1);
        assert_eq!(f.reconciler.unread(f.conversation_id), 1);
        assert_eq!(f.cache.unread_total(), 1);
        let conversation = f.cache.conversation(f.conversation_id).unwrap();
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(conversation.last_message.as_deref(), Some("hello 1"));
        assert!(conversation.participant_ids.contains(&f.peer));
    }

    #[tokio::test]
    async fn test_out_of_order_sequences_keep_high_water_and_fill_gap() {
        let f = fixture(50);
        for seq in [5, 3, 7, 7, 6] {
            f.reconciler
                .apply(PushEvent::MessageNew(new_message(&f, seq, f.peer)))
                .await;
        }

        assert_eq!(f.reconciler.cursor(f.conversation_id), Some(7));
        assert_eq!(sequences(&f.cache, f.conversation_id), vec![5, 6, 7]);
        let stored = f.store.load_messages(f.conversation_id).await.unwrap();
        assert_eq!(stored.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert_eq!(f.reconciler.unread(f.conversation_id), 3);
    }

    #[tokio::test]
    async fn test_local_echo_removes_every_provisional_record() {
        let f = fixture(50);
        f.cache.update_messages(f.conversation_id, |list| {
            list.push(provisional(&f, 0));
            list.push(provisional(&f, -1));
        });

        let outcome = f
            .reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 1, f.me)))
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let messages = f.cache.messages(f.conversation_id);
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].is_provisional());
        assert_eq!(f.reconciler.unread(f.conversation_id), 0);
    }

    #[tokio::test]
    async fn test_peer_message_keeps_local_provisional() {
        let f = fixture(50);
        f.cache
            .update_messages(f.conversation_id, |list| list.push(provisional(&f, 0)));

        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 4, f.peer)))
            .await;

        let messages = f.cache.messages(f.conversation_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence, 4);
        assert!(messages[1].is_provisional());
        // provisional records never reach the store
        assert_eq!(f.store.load_messages(f.conversation_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_self_read_resets_unread() {
        let f = fixture(50);
        for seq in 1..=4 {
            f.reconciler
                .apply(PushEvent::MessageNew(new_message(&f, seq, f.peer)))
                .await;
        }
        assert_eq!(f.cache.unread_total(), 4);

        let read = PushEvent::MessageRead(MessageReadEvent {
            conversation_id: f.conversation_id,
            reader_id: f.me,
        });
        assert_eq!(f.reconciler.apply(read).await, ApplyOutcome::Applied);

        assert_eq!(f.reconciler.unread(f.conversation_id), 0);
        assert_eq!(f.cache.unread_total(), 0);
        let stored = f.store.load_conversations().await.unwrap();
        assert_eq!(stored[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_peer_read_marks_own_messages() {
        let f = fixture(50);
        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 1, f.me)))
            .await;
        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 2, f.peer)))
            .await;

        f.reconciler
            .apply(PushEvent::MessageRead(MessageReadEvent {
                conversation_id: f.conversation_id,
                reader_id: f.peer,
            }))
            .await;

        let messages = f.cache.messages(f.conversation_id);
        assert!(messages[0].read);
        assert!(!messages[1].read);
        let stored = f.store.load_messages(f.conversation_id).await.unwrap();
        assert!(stored[0].read);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_projection() {
        let f = fixture(50);
        f.store.set_fail_writes(true);

        let outcome = f
            .reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 1, f.peer)))
            .await;
        assert_eq!(outcome, ApplyOutcome::AppliedNotPersisted);
        assert_eq!(f.cache.messages(f.conversation_id).len(), 1);
        assert_eq!(f.reconciler.cursor(f.conversation_id), Some(1));

        f.store.set_fail_writes(false);
        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 2, f.peer)))
            .await;

        // the next successful write carries the missed record
        let stored = f.store.load_messages(f.conversation_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(f.store.load_cursors().await.unwrap()[&f.conversation_id], 2);
    }

    #[tokio::test]
    async fn test_retention_window_caps_durable_list() {
        let f = fixture(3);
        for seq in 1..=6 {
            f.reconciler
                .apply(PushEvent::MessageNew(new_message(&f, seq, f.peer)))
                .await;
        }

        assert_eq!(f.cache.messages(f.conversation_id).len(), 6);
        let stored = f.store.load_messages(f.conversation_id).await.unwrap();
        assert_eq!(stored.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_media_events_match_by_media_id() {
        let f = fixture(50);
        let mut event = new_message(&f, 1, f.peer);
        event.kind = MessageKind::Photo;
        event.content = None;
        event.media_ref = Some(MediaRef {
            id: "media-9".to_string(),
            url: None,
            processing_status: ProcessingStatus::Processing,
            receiver_status: ReceiverStatus::Pending,
            view_mode: ViewMode::OneTime { duration_secs: 5 },
            viewed: false,
            is_reel: false,
        });
        f.reconciler.apply(PushEvent::MessageNew(event)).await;

        let ready = PushEvent::MediaReady(MediaReadyEvent {
            media_id: "media-9".to_string(),
            conversation_id: f.conversation_id,
            processing_status: ProcessingStatus::Completed,
            receiver_status: ReceiverStatus::Pending,
            moderation_result: None,
            url: Some("https://cdn.example/media-9.jpg".to_string()),
        });
        assert_eq!(f.reconciler.apply(ready.clone()).await, ApplyOutcome::Applied);

        let accepted = PushEvent::MediaAccepted(MediaDecisionEvent {
            media_id: "media-9".to_string(),
            conversation_id: f.conversation_id,
            actor_id: f.me,
        });
        f.reconciler.apply(accepted).await;
        let media = f.cache.messages(f.conversation_id)[0].media.clone().unwrap();
        assert!(media.is_revealable());

        assert_eq!(
            f.reconciler.apply_local_view("media-9").await,
            ApplyOutcome::Applied
        );
        f.reconciler.apply(ready).await;
        let media = f.cache.messages(f.conversation_id)[0].media.clone().unwrap();
        assert!(media.viewed);
        assert!(!media.is_revealable());
    }

    fn photo_message(f: &Fixture, sequence: i64, media_id: &str) -> NewMessageEvent {
        let mut event = new_message(f, sequence, f.peer);
        event.kind = MessageKind::Photo;
        event.content = None;
        event.media_ref = Some(MediaRef {
            id: media_id.to_string(),
            url: None,
            processing_status: ProcessingStatus::Processing,
            receiver_status: ReceiverStatus::Pending,
            view_mode: ViewMode::Unlimited,
            viewed: false,
            is_reel: false,
        });
        event
    }

    #[tokio::test]
    async fn test_media_ready_before_its_message_is_merged_on_arrival() {
        let f = fixture(50);
        let ready = PushEvent::MediaReady(MediaReadyEvent {
            media_id: "media-1".to_string(),
            conversation_id: f.conversation_id,
            processing_status: ProcessingStatus::Completed,
            receiver_status: ReceiverStatus::Pending,
            moderation_result: Some("clean".to_string()),
            url: Some("https://cdn.example/media-1.jpg".to_string()),
        });
        let accepted = PushEvent::MediaAccepted(MediaDecisionEvent {
            media_id: "media-1".to_string(),
            conversation_id: f.conversation_id,
            actor_id: f.me,
        });

        assert_eq!(f.reconciler.apply(ready).await, ApplyOutcome::Deferred);
        assert_eq!(f.reconciler.apply(accepted).await, ApplyOutcome::Deferred);
        assert_eq!(f.store.write_count(), 0);

        let outcome = f
            .reconciler
            .apply(PushEvent::MessageNew(photo_message(&f, 1, "media-1")))
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let media = f.cache.messages(f.conversation_id)[0].media.clone().unwrap();
        assert_eq!(media.processing_status, ProcessingStatus::Completed);
        assert_eq!(media.receiver_status, ReceiverStatus::Accepted);
        assert_eq!(media.url.as_deref(), Some("https://cdn.example/media-1.jpg"));
        assert!(media.is_revealable());

        let stored = f.store.load_messages(f.conversation_id).await.unwrap();
        let stored_media = stored[0].media.as_ref().unwrap();
        assert_eq!(stored_media.processing_status, ProcessingStatus::Completed);
        assert!(stored_media.url.is_some());
    }

    #[tokio::test]
    async fn test_parked_media_is_merged_into_history_page() {
        let f = fixture(50);
        f.reconciler
            .apply(PushEvent::MediaRejected(MediaDecisionEvent {
                media_id: "media-2".to_string(),
                conversation_id: f.conversation_id,
                actor_id: f.peer,
            }))
            .await;

        let page = vec![new_message(&f, 1, f.peer), photo_message(&f, 2, "media-2")];
        f.reconciler
            .apply_history_page(f.conversation_id, page, PageKind::Latest)
            .await;

        let media = f.cache.messages(f.conversation_id)[1].media.clone().unwrap();
        assert_eq!(media.receiver_status, ReceiverStatus::Rejected);
    }

    #[tokio::test]
    async fn test_local_view_of_unknown_media_is_unmatched() {
        let f = fixture(50);
        assert_eq!(
            f.reconciler.apply_local_view("missing").await,
            ApplyOutcome::Unmatched
        );
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_delivered_and_typing() {
        let f = fixture(50);
        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 1, f.me)))
            .await;

        let delivered = PushEvent::MessageDelivered(MessageDeliveredEvent {
            message_id: "m-1".to_string(),
            delivered_to: f.peer,
        });
        assert_eq!(f.reconciler.apply(delivered).await, ApplyOutcome::Applied);
        assert!(f.cache.messages(f.conversation_id)[0].delivered);

        let typing = PushEvent::Typing(TypingEvent {
            user_id: f.peer,
            is_typing: true,
        });
        let writes = f.store.write_count();
        assert_eq!(f.reconciler.apply(typing).await, ApplyOutcome::Transient);
        assert!(f.cache.is_typing(f.peer));
        assert_eq!(f.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_match_lifecycle() {
        let f = fixture(50);
        let created = PushEvent::MatchCreated(ConversationSnapshot {
            id: f.conversation_id,
            participant_ids: vec![f.me, f.peer],
            last_message: None,
            last_message_at: None,
            unread_count: 2,
            compatibility_score: Some(0.87),
        });
        f.reconciler.apply(created).await;
        assert_eq!(f.cache.unread_total(), 2);
        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 1, f.peer)))
            .await;
        assert_eq!(f.cache.unread_total(), 3);

        let outcome = f.reconciler.remove_conversation(f.conversation_id).await;
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(f.cache.conversation(f.conversation_id).is_none());
        assert!(f.cache.messages(f.conversation_id).is_empty());
        assert_eq!(f.cache.unread_total(), 0);
        assert_eq!(f.reconciler.cursor(f.conversation_id), None);
        assert!(f.store.load_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_after_unmatch_does_not_recreate_conversation() {
        let f = fixture(50);
        let event = PushEvent::MessageNew(new_message(&f, 1, f.peer));
        assert_eq!(f.reconciler.apply(event.clone()).await, ApplyOutcome::Applied);

        f.reconciler.remove_conversation(f.conversation_id).await;
        assert_eq!(f.reconciler.apply(event).await, ApplyOutcome::Duplicate);

        assert!(f.cache.conversation(f.conversation_id).is_none());
        assert!(f.cache.messages(f.conversation_id).is_empty());
        assert_eq!(f.cache.unread_total(), 0);
        assert!(f.store.load_conversations().await.unwrap().is_empty());
        assert!(f.store.load_messages(f.conversation_id).await.unwrap().is_empty());

        let page = vec![new_message(&f, 1, f.peer)];
        assert_eq!(
            f.reconciler
                .apply_history_page(f.conversation_id, page, PageKind::Latest)
                .await,
            ApplyOutcome::Unmatched
        );
        assert!(f.cache.conversation(f.conversation_id).is_none());
    }

    #[tokio::test]
    async fn test_removed_conversation_survives_restart_until_matched_again() {
        let f = fixture(50);
        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 1, f.peer)))
            .await;
        f.reconciler.remove_conversation(f.conversation_id).await;

        let cache = Arc::new(QueryCache::new());
        let restored = EventReconciler::new(f.me, cache.clone(), f.store.clone(), 50);
        assert_eq!(restored.rehydrate().await.unwrap(), 0);
        assert_eq!(
            restored
                .apply(PushEvent::MessageNew(new_message(&f, 1, f.peer)))
                .await,
            ApplyOutcome::Duplicate
        );

        let rematched = PushEvent::MatchCreated(ConversationSnapshot {
            id: f.conversation_id,
            participant_ids: vec![f.me, f.peer],
            last_message: None,
            last_message_at: None,
            unread_count: 0,
            compatibility_score: None,
        });
        assert_eq!(restored.apply(rematched).await, ApplyOutcome::Applied);
        assert_eq!(
            restored
                .apply(PushEvent::MessageNew(new_message(&f, 1, f.peer)))
                .await,
            ApplyOutcome::Applied
        );
        assert_eq!(cache.unread_total(), 1);
        assert_eq!(
            f.store.get_value(REMOVED_CONVERSATIONS_KEY).await.unwrap().as_deref(),
            Some("[]")
        );
    }

    #[tokio::test]
    async fn test_history_page_skips_present_sequences() {
        let f = fixture(50);
        f.reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 5, f.peer)))
            .await;

        let page: Vec<NewMessageEvent> = (3..=5).map(|s| new_message(&f, s, f.peer)).collect();
        f.reconciler
            .apply_history_page(f.conversation_id, page, PageKind::Older)
            .await;

        assert_eq!(sequences(&f.cache, f.conversation_id), vec![3, 4, 5]);
        assert_eq!(f.reconciler.cursor(f.conversation_id), Some(5));
        // history records never count as unread
        assert_eq!(f.reconciler.unread(f.conversation_id), 1);
    }

    #[tokio::test]
    async fn test_rehydrate_restores_state() {
        let f = fixture(50);
        for seq in [1, 2, 4] {
            f.reconciler
                .apply(PushEvent::MessageNew(new_message(&f, seq, f.peer)))
                .await;
        }

        let cache = Arc::new(QueryCache::new());
        let restored = EventReconciler::new(f.me, cache.clone(), f.store.clone(), 50);
        assert_eq!(restored.rehydrate().await.unwrap(), 1);

        assert_eq!(sequences(&cache, f.conversation_id), vec![1, 2, 4]);
        assert_eq!(restored.cursor(f.conversation_id), Some(4));
        assert_eq!(cache.unread_total(), 3);

        // the hole at 3 survives the restart
        let late = PushEvent::MessageNew(new_message(&f, 3, f.peer));
        assert_eq!(restored.apply(late.clone()).await, ApplyOutcome::Applied);
        assert_eq!(restored.apply(late).await, ApplyOutcome::Duplicate);
        assert_eq!(sequences(&cache, f.conversation_id), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_message_without_sequence_is_invalid() {
        let f = fixture(50);
        let outcome = f
            .reconciler
            .apply(PushEvent::MessageNew(new_message(&f, 0, f.peer)))
            .await;
        assert_eq!(outcome, ApplyOutcome::Invalid);
        assert!(f.cache.conversation(f.conversation_id).is_none());
    }
}
