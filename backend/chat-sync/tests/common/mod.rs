//! Shared fixtures for chat-sync integration tests
#![allow(dead_code)]

pub mod properties;

use chat_sync::history::StaticHistory;
use chat_sync::store::DurableStore;
use chat_sync::transport::ChannelTransport;
use chat_sync::{CacheKey, SyncConfig, SyncSession};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use event_schema::{
    ConversationSnapshot, MessageKind, NewMessageEvent, OutboundCommand, PushEvent, TypingEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Upper bound for waiting on the background event pump
pub const WAIT: Duration = Duration::from_secs(2);

pub fn test_config() -> SyncConfig {
    SyncConfig {
        database_url: "sqlite::memory:".to_string(),
        retention_window: 50,
        page_size: 30,
        provisional_timeout: None,
        event_buffer: 64,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ids {
    pub me: Uuid,
    pub peer: Uuid,
    pub conversation_id: Uuid,
}

impl Ids {
    pub fn new() -> Self {
        Self {
            me: Uuid::new_v4(),
            peer: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
        }
    }

    /// Same participants, another conversation
    pub fn other_conversation(&self) -> Self {
        Self {
            conversation_id: Uuid::new_v4(),
            ..*self
        }
    }
}

pub struct Harness {
    pub session: SyncSession,
    pub transport: Arc<ChannelTransport>,
}

impl Harness {
    pub async fn start(
        config: SyncConfig,
        me: Uuid,
        store: Arc<dyn DurableStore>,
        history: StaticHistory,
    ) -> Self {
        let transport = Arc::new(ChannelTransport::new());
        let session = SyncSession::init(config, me, store, transport.clone(), Arc::new(history))
            .await
            .expect("Failed to start sync session");
        Self { session, transport }
    }

    /// Push an event through the transport
    pub async fn deliver(&self, event: PushEvent) {
        assert_eq!(self.transport.deliver(event).await, 1, "no live subscriber");
    }

    /// Wait until every event delivered so far has been handled by the pump
    pub async fn settle(&self) {
        let marker = Uuid::new_v4();
        let mut subscription = self.session.subscribe(CacheKey::Typing(marker));
        self.deliver(typing(marker, false)).await;
        timeout(WAIT, subscription.changed())
            .await
            .expect("event pump did not settle")
            .expect("projection dropped");
    }

    /// Wait until the transport has accepted `count` commands
    pub async fn wait_for_sent(&self, count: usize) -> Vec<OutboundCommand> {
        timeout(WAIT, async {
            loop {
                let sent = self.transport.sent_commands().await;
                if sent.len() >= count {
                    return sent;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("commands were not sent")
    }

    pub fn sequences(&self, conversation_id: Uuid) -> Vec<i64> {
        self.session
            .projection()
            .messages(conversation_id)
            .iter()
            .map(|m| m.sequence)
            .collect()
    }
}

pub fn text_message(ids: &Ids, sequence: i64, sender: Uuid) -> NewMessageEvent {
    NewMessageEvent {
        id: format!("m{}", sequence),
        sequence,
        conversation_id: ids.conversation_id,
        sender_id: sender,
        kind: MessageKind::Text,
        content: Some(format!("message {}", sequence)),
        media_ref: None,
        created_at: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
            + ChronoDuration::seconds(sequence),
        delivered: false,
        read: false,
    }
}

pub fn message_new(ids: &Ids, sequence: i64, sender: Uuid) -> PushEvent {
    PushEvent::MessageNew(text_message(ids, sequence, sender))
}

/// Full server-side history `1..=count`, alternating senders
pub fn server_history(ids: &Ids, count: i64) -> Vec<NewMessageEvent> {
    (1..=count)
        .map(|seq| {
            let sender = if seq % 2 == 0 { ids.me } else { ids.peer };
            text_message(ids, seq, sender)
        })
        .collect()
}

pub fn match_created(ids: &Ids, unread_count: u32) -> PushEvent {
    PushEvent::MatchCreated(ConversationSnapshot {
        id: ids.conversation_id,
        participant_ids: vec![ids.me, ids.peer],
        last_message: None,
        last_message_at: None,
        unread_count,
        compatibility_score: Some(0.92),
    })
}

pub fn typing(user_id: Uuid, is_typing: bool) -> PushEvent {
    PushEvent::Typing(TypingEvent { user_id, is_typing })
}
