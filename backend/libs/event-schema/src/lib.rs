/// Wire schema for the chat realtime channel
///
/// The socket delivers push events at-least-once: the same event may arrive
/// twice, and events may be reordered within a connection. Every frame is a
/// JSON object of the form `{"event": "<name>", "data": {...}}`.
///
/// The same message record shape is used by the paginated history endpoint,
/// so cold loads and live pushes share one decoder.
use serde::{Deserialize, Serialize};

// Outbound commands (client -> server)
pub mod commands;
// Inbound push events (server -> client)
pub mod events;

// Re-export commonly used types
pub use commands::{OutboundCommand, SendMessageCommand};
pub use events::{
    ConversationSnapshot, MatchRemovedEvent, MediaDecisionEvent, MediaReadyEvent, MediaRef,
    MessageDeliveredEvent, MessageKind, MessageReadEvent, NewMessageEvent, ProcessingStatus,
    PushEvent, ReceiverStatus, TypingEvent, ViewMode,
};

/// Current schema version of the realtime channel
pub const SCHEMA_VERSION: u32 = 1;

/// One page of the cold-load / pagination endpoint.
///
/// Messages are ordered oldest to newest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<NewMessageEvent>,
    #[serde(default)]
    pub has_more: bool,
}
