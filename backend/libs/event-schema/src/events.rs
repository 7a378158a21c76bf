//! Inbound push events
//!
//! Only `message.new` carries a sequence number. Media events are matched by
//! media id and may arrive before or after the message that introduced the
//! media. `typing` is transient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Voice,
    Photo,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Voice => "voice",
            MessageKind::Photo => "photo",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "voice" => Some(MessageKind::Voice),
            "photo" => Some(MessageKind::Photo),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// Server-side moderation/transcoding state of an uploaded media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Completed,
    Failed,
}

/// Receiver's decision on an incoming media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ViewMode {
    Unlimited,
    OneTime {
        #[serde(rename = "durationSecs")]
        duration_secs: u32,
    },
}

impl ViewMode {
    pub fn is_one_time(&self) -> bool {
        matches!(self, ViewMode::OneTime { .. })
    }
}

impl Default for ViewMode {
    fn default() -> Self {
        ViewMode::Unlimited
    }
}

/// Media descriptor as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub processing_status: ProcessingStatus,
    pub receiver_status: ReceiverStatus,
    #[serde(default)]
    pub view_mode: ViewMode,
    #[serde(default)]
    pub viewed: bool,
    #[serde(default)]
    pub is_reel: bool,
}

/// `message.new`, also the record shape of the history endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub id: String,
    pub sequence: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_ref: Option<MediaRef>,
    pub created_at: DateTime<Utc>,
    // Only populated by the history endpoint
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadEvent {
    pub conversation_id: Uuid,
    pub reader_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeliveredEvent {
    pub message_id: String,
    pub delivered_to: Uuid,
}

/// Payload shared by `media.accepted` and `media.rejected`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDecisionEvent {
    pub media_id: String,
    pub conversation_id: Uuid,
    pub actor_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaReadyEvent {
    pub media_id: String,
    pub conversation_id: Uuid,
    pub processing_status: ProcessingStatus,
    pub receiver_status: ReceiverStatus,
    #[serde(default)]
    pub moderation_result: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: Uuid,
    pub is_typing: bool,
}

/// Server view of a conversation, sent when a mutual match is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub id: Uuid,
    pub participant_ids: Vec<Uuid>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub compatibility_score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRemovedEvent {
    pub conversation_id: Uuid,
}

/// Tagged inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushEvent {
    #[serde(rename = "message.new")]
    MessageNew(NewMessageEvent),
    #[serde(rename = "message.read")]
    MessageRead(MessageReadEvent),
    #[serde(rename = "message.delivered")]
    MessageDelivered(MessageDeliveredEvent),
    #[serde(rename = "media.accepted")]
    MediaAccepted(MediaDecisionEvent),
    #[serde(rename = "media.rejected")]
    MediaRejected(MediaDecisionEvent),
    #[serde(rename = "media.ready")]
    MediaReady(MediaReadyEvent),
    #[serde(rename = "typing")]
    Typing(TypingEvent),
    #[serde(rename = "match.created")]
    MatchCreated(ConversationSnapshot),
    #[serde(rename = "match.removed")]
    MatchRemoved(MatchRemovedEvent),
}

impl PushEvent {
    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            PushEvent::MessageNew(_) => "message.new",
            PushEvent::MessageRead(_) => "message.read",
            PushEvent::MessageDelivered(_) => "message.delivered",
            PushEvent::MediaAccepted(_) => "media.accepted",
            PushEvent::MediaRejected(_) => "media.rejected",
            PushEvent::MediaReady(_) => "media.ready",
            PushEvent::Typing(_) => "typing",
            PushEvent::MatchCreated(_) => "match.created",
            PushEvent::MatchRemoved(_) => "match.removed",
        }
    }

    /// Conversation this event targets, when the payload names one
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            PushEvent::MessageNew(e) => Some(e.conversation_id),
            PushEvent::MessageRead(e) => Some(e.conversation_id),
            PushEvent::MediaAccepted(e) | PushEvent::MediaRejected(e) => Some(e.conversation_id),
            PushEvent::MediaReady(e) => Some(e.conversation_id),
            PushEvent::MatchCreated(c) => Some(c.id),
            PushEvent::MatchRemoved(e) => Some(e.conversation_id),
            PushEvent::MessageDelivered(_) | PushEvent::Typing(_) => None,
        }
    }

    /// Transient events are neither persisted nor deduplicated
    pub fn is_transient(&self) -> bool {
        matches!(self, PushEvent::Typing(_))
    }
}
