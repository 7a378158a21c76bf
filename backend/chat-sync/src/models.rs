use chrono::{DateTime, Utc};
use event_schema::{
    ConversationSnapshot, MediaReadyEvent, MediaRef, MessageKind, NewMessageEvent,
    ProcessingStatus, ReceiverStatus, ViewMode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ConversationId = Uuid;
pub type UserId = Uuid;

/// Prefix of locally assigned message ids; server ids never carry it
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

/// Delivery lifecycle of a message record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendState {
    /// Server-confirmed, carries a valid sequence number
    Confirmed,
    /// Provisional, waiting for the server echo
    Pending,
    /// Provisional, rejected by the transport or never confirmed
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub id: String,
    pub url: Option<String>,
    pub processing_status: ProcessingStatus,
    pub receiver_status: ReceiverStatus,
    pub view_mode: ViewMode,
    pub viewed: bool,
    pub is_reel: bool,
    pub moderation_result: Option<String>,
}

impl MediaDescriptor {
    pub fn is_one_time(&self) -> bool {
        self.view_mode.is_one_time()
    }

    /// Consumed one-time media can never be shown again
    pub fn is_consumed(&self) -> bool {
        self.is_one_time() && self.viewed
    }

    /// Whether the UI may reveal the media content
    pub fn is_revealable(&self) -> bool {
        !self.is_consumed()
            && self.processing_status == ProcessingStatus::Completed
            && self.receiver_status != ReceiverStatus::Rejected
            && self.url.is_some()
    }

    /// Merge a `media.ready` payload. `viewed` is sticky and a consumed
    /// one-time item never gets its url back.
    pub fn merge_ready(&mut self, ready: &MediaReadyEvent) {
        self.processing_status = ready.processing_status;
        self.receiver_status = ready.receiver_status;
        if ready.moderation_result.is_some() {
            self.moderation_result = ready.moderation_result.clone();
        }
        if self.is_consumed() {
            self.url = None;
        } else if ready.url.is_some() {
            self.url = ready.url.clone();
        }
    }

    pub fn apply_decision(&mut self, status: ReceiverStatus) {
        self.receiver_status = status;
    }

    /// Returns true when the flag changed
    pub fn mark_viewed(&mut self) -> bool {
        if self.viewed {
            return false;
        }
        self.viewed = true;
        if self.is_one_time() {
            self.url = None;
        }
        true
    }

    pub fn to_wire(&self) -> MediaRef {
        MediaRef {
            id: self.id.clone(),
            url: self.url.clone(),
            processing_status: self.processing_status,
            receiver_status: self.receiver_status,
            view_mode: self.view_mode,
            viewed: self.viewed,
            is_reel: self.is_reel,
        }
    }
}

impl From<MediaRef> for MediaDescriptor {
    fn from(media: MediaRef) -> Self {
        let mut descriptor = Self {
            id: media.id,
            url: media.url,
            processing_status: media.processing_status,
            receiver_status: media.receiver_status,
            view_mode: media.view_mode,
            viewed: media.viewed,
            is_reel: media.is_reel,
            moderation_result: None,
        };
        if descriptor.is_consumed() {
            descriptor.url = None;
        }
        descriptor
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Server sequence; zero or negative while provisional
    pub sequence: i64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub delivered: bool,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub send_state: SendState,
}

impl Message {
    pub fn is_provisional(&self) -> bool {
        self.sequence <= 0
    }

    pub fn media_id(&self) -> Option<&str> {
        self.media.as_ref().map(|m| m.id.as_str())
    }

    /// Short text shown in the conversation list
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text | MessageKind::System => self.content.clone().unwrap_or_default(),
            MessageKind::Photo => "Photo".to_string(),
            MessageKind::Voice => "Voice message".to_string(),
        }
    }
}

impl From<NewMessageEvent> for Message {
    fn from(event: NewMessageEvent) -> Self {
        Self {
            id: event.id,
            sequence: event.sequence,
            conversation_id: event.conversation_id,
            sender_id: event.sender_id,
            kind: event.kind,
            content: event.content,
            media: event.media_ref.map(MediaDescriptor::from),
            delivered: event.delivered,
            read: event.read,
            created_at: event.created_at,
            send_state: SendState::Confirmed,
        }
    }
}

/// Content of a user-initiated send
#[derive(Debug, Clone, PartialEq)]
pub enum Draft {
    Text(String),
    Photo(MediaDescriptor),
    Voice(MediaDescriptor),
}

impl Draft {
    pub fn kind(&self) -> MessageKind {
        match self {
            Draft::Text(_) => MessageKind::Text,
            Draft::Photo(_) => MessageKind::Photo,
            Draft::Voice(_) => MessageKind::Voice,
        }
    }

    pub(crate) fn into_parts(self) -> (Option<String>, Option<MediaDescriptor>) {
        match self {
            Draft::Text(text) => (Some(text), None),
            Draft::Photo(media) | Draft::Voice(media) => (None, Some(media)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_ids: Vec<UserId>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// Display-only compatibility score
    pub compatibility_score: Option<f32>,
}

impl Conversation {
    /// Stand-in for a conversation first seen through a message event
    pub fn placeholder(id: ConversationId, participants: &[UserId]) -> Self {
        let mut participant_ids: Vec<UserId> = Vec::with_capacity(participants.len());
        for p in participants {
            if !participant_ids.contains(p) {
                participant_ids.push(*p);
            }
        }
        Self {
            id,
            participant_ids,
            last_message: None,
            last_message_at: None,
            unread_count: 0,
            compatibility_score: None,
        }
    }

    /// Update the denormalized preview unless `message` is older than it
    pub fn apply_preview(&mut self, message: &Message) -> bool {
        let newer = match self.last_message_at {
            Some(at) => message.created_at >= at,
            None => true,
        };
        if newer {
            self.last_message = Some(message.preview());
            self.last_message_at = Some(message.created_at);
        }
        newer
    }
}

impl From<ConversationSnapshot> for Conversation {
    fn from(snapshot: ConversationSnapshot) -> Self {
        Self {
            id: snapshot.id,
            participant_ids: snapshot.participant_ids,
            last_message: snapshot.last_message,
            last_message_at: snapshot.last_message_at,
            unread_count: snapshot.unread_count,
            compatibility_score: snapshot.compatibility_score,
        }
    }
}
