//! Cache projection layer
//!
//! In-memory, UI-facing working copy of conversation and message state.
//! Reads are synchronous and never suspend. Mutation methods are crate
//! private: only the reconciler and the optimistic sender write here, so UI
//! code cannot race event-driven writes.
//!
//! Consumers observe changes through [`Subscription`]s keyed by
//! [`CacheKey`]. Dropping a subscription unregisters it.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::models::{Conversation, ConversationId, Message, UserId};

/// Key schema version, bump when key formats change
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    ConversationList,
    Conversation(ConversationId),
    Messages(ConversationId),
    UnreadTotal,
    Typing(UserId),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::ConversationList => write!(f, "v{}:conversations", CACHE_VERSION),
            CacheKey::Conversation(id) => write!(f, "v{}:conversation:{}", CACHE_VERSION, id),
            CacheKey::Messages(id) => write!(f, "v{}:messages:{}", CACHE_VERSION, id),
            CacheKey::UnreadTotal => write!(f, "v{}:unread:total", CACHE_VERSION),
            CacheKey::Typing(id) => write!(f, "v{}:typing:{}", CACHE_VERSION, id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    ConversationList(Vec<Conversation>),
    Conversation(Conversation),
    Messages(Vec<Message>),
    UnreadTotal(u64),
    Typing(bool),
}

/// Unique identifier of a projection subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<CacheKey>,
}

type SubscriberMap = DashMap<CacheKey, Vec<Subscriber>>;

/// Change feed for one cache key
pub struct Subscription {
    id: SubscriberId,
    key: CacheKey,
    receiver: UnboundedReceiver<CacheKey>,
    registry: Weak<SubscriberMap>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the next change of the subscribed key
    pub async fn changed(&mut self) -> Option<CacheKey> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`Subscription::changed`]
    pub fn try_changed(&mut self) -> Option<CacheKey> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let now_empty = match registry.get_mut(&self.key) {
            Some(mut subscribers) => {
                subscribers.retain(|s| s.id != self.id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            registry.remove_if(&self.key, |_, subscribers| subscribers.is_empty());
        }
        debug!(subscriber = ?self.id, key = %self.key, "Projection subscriber removed");
    }
}

#[derive(Default)]
pub struct QueryCache {
    conversations: DashMap<ConversationId, Conversation>,
    messages: DashMap<ConversationId, Vec<Message>>,
    typing: DashMap<UserId, bool>,
    unread_total: AtomicU64,
    subscribers: Arc<SubscriberMap>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ============= Reads =============

    /// Keyed lookup
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        match key {
            CacheKey::ConversationList => Some(CacheValue::ConversationList(self.conversations())),
            CacheKey::Conversation(id) => self.conversation(*id).map(CacheValue::Conversation),
            CacheKey::Messages(id) => self
                .messages
                .get(id)
                .map(|list| CacheValue::Messages(list.clone())),
            CacheKey::UnreadTotal => Some(CacheValue::UnreadTotal(self.unread_total())),
            CacheKey::Typing(user_id) => self.typing.get(user_id).map(|t| CacheValue::Typing(*t)),
        }
    }

    /// Conversations, most recent activity first
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        list
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.conversations
            .get(&conversation_id)
            .map(|c| c.value().clone())
    }

    pub fn contains_conversation(&self, conversation_id: ConversationId) -> bool {
        self.conversations.contains_key(&conversation_id)
    }

    /// Messages of a conversation: confirmed by sequence, provisional last
    pub fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.messages
            .get(&conversation_id)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn provisional_messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.messages
            .get(&conversation_id)
            .map(|list| list.iter().filter(|m| m.is_provisional()).cloned().collect())
            .unwrap_or_default()
    }

    /// Oldest confirmed message, the cursor for backward pagination
    pub fn oldest_confirmed(&self, conversation_id: ConversationId) -> Option<Message> {
        self.messages.get(&conversation_id).and_then(|list| {
            list.iter()
                .filter(|m| !m.is_provisional())
                .min_by_key(|m| m.sequence)
                .cloned()
        })
    }

    pub fn unread_total(&self) -> u64 {
        self.unread_total.load(Ordering::SeqCst)
    }

    pub fn is_typing(&self, user_id: UserId) -> bool {
        self.typing.get(&user_id).map(|t| *t).unwrap_or(false)
    }

    /// Subscribe to changes of one key
    pub fn subscribe(&self, key: CacheKey) -> Subscription {
        let (sender, receiver) = unbounded_channel();
        let id = SubscriberId::new();

        self.subscribers
            .entry(key.clone())
            .or_default()
            .push(Subscriber { id, sender });

        debug!(subscriber = ?id, key = %key, "Projection subscriber added");

        Subscription {
            id,
            key,
            receiver,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscribers.get(key).map(|s| s.len()).unwrap_or(0)
    }

    // ============= Writes (reconciler / optimistic sender only) =============

    pub(crate) fn upsert_conversation(&self, conversation: Conversation) {
        let id = conversation.id;
        self.conversations.insert(id, conversation);
        self.notify_conversation(id);
    }

    /// Mutate a conversation in place; `None` if it is not projected
    pub(crate) fn update_conversation<R>(
        &self,
        conversation_id: ConversationId,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Option<R> {
        let result = {
            let mut entry = self.conversations.get_mut(&conversation_id)?;
            f(entry.value_mut())
        };
        self.notify_conversation(conversation_id);
        Some(result)
    }

    pub(crate) fn remove_conversation(&self, conversation_id: ConversationId) -> bool {
        let removed = self.conversations.remove(&conversation_id).is_some();
        self.messages.remove(&conversation_id);
        self.notify_conversation(conversation_id);
        self.notify(&CacheKey::Messages(conversation_id));
        removed
    }

    /// Mutate the message list of a conversation in place.
    ///
    /// The closure runs under the list's lock and must not call back into
    /// the cache.
    pub(crate) fn update_messages<R>(
        &self,
        conversation_id: ConversationId,
        f: impl FnOnce(&mut Vec<Message>) -> R,
    ) -> R {
        let result = {
            let mut list = self.messages.entry(conversation_id).or_default();
            f(list.value_mut())
        };
        self.notify(&CacheKey::Messages(conversation_id));
        result
    }

    /// Like [`QueryCache::update_messages`], but never creates a list
    pub(crate) fn update_existing_messages<R>(
        &self,
        conversation_id: ConversationId,
        f: impl FnOnce(&mut Vec<Message>) -> R,
    ) -> Option<R> {
        let result = {
            let mut list = self.messages.get_mut(&conversation_id)?;
            f(list.value_mut())
        };
        self.notify(&CacheKey::Messages(conversation_id));
        Some(result)
    }

    /// Locate the conversation holding a message id
    pub(crate) fn find_message_conversation(&self, message_id: &str) -> Option<ConversationId> {
        self.messages
            .iter()
            .find(|entry| entry.value().iter().any(|m| m.id == message_id))
            .map(|entry| *entry.key())
    }

    /// Locate the conversation holding a media id, looking in `hint` before
    /// scanning every conversation
    pub(crate) fn find_media_conversation(
        &self,
        media_id: &str,
        hint: Option<ConversationId>,
    ) -> Option<ConversationId> {
        if let Some(hint) = hint {
            let held = self
                .messages
                .get(&hint)
                .map(|list| list.iter().any(|m| m.media_id() == Some(media_id)))
                .unwrap_or(false);
            if held {
                return Some(hint);
            }
        }
        self.messages
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .iter()
                    .any(|m| m.media_id() == Some(media_id))
            })
            .map(|entry| *entry.key())
    }

    pub(crate) fn set_typing(&self, user_id: UserId, is_typing: bool) {
        if is_typing {
            self.typing.insert(user_id, true);
        } else {
            self.typing.remove(&user_id);
        }
        self.notify(&CacheKey::Typing(user_id));
    }

    pub(crate) fn set_unread_total(&self, total: u64) {
        let previous = self.unread_total.swap(total, Ordering::SeqCst);
        if previous != total {
            self.notify(&CacheKey::UnreadTotal);
        }
    }

    /// Drop all projected state; subscribers stay registered
    pub(crate) fn clear(&self) {
        let conversation_ids: Vec<ConversationId> =
            self.conversations.iter().map(|e| *e.key()).collect();
        self.conversations.clear();
        self.messages.clear();
        self.typing.clear();
        self.set_unread_total(0);

        for id in conversation_ids {
            self.notify(&CacheKey::Conversation(id));
            self.notify(&CacheKey::Messages(id));
        }
        self.notify(&CacheKey::ConversationList);
    }

    fn notify_conversation(&self, conversation_id: ConversationId) {
        self.notify(&CacheKey::Conversation(conversation_id));
        self.notify(&CacheKey::ConversationList);
    }

    /// Push a change notification, dropping subscribers whose receiver is gone
    fn notify(&self, key: &CacheKey) {
        if let Some(mut subscribers) = self.subscribers.get_mut(key) {
            let before = subscribers.len();
            subscribers.retain(|s| s.sender.send(key.clone()).is_ok());
            let after = subscribers.len();
            if before != after {
                debug!(
                    key = %key,
                    dead = before - after,
                    active = after,
                    "Cleaned up dead projection subscribers"
                );
            }
        }
    }
}
