//! Outbound commands issued to the transport
//!
//! All commands are fire-and-forget from the caller's point of view. The
//! server answers a `send-message` by broadcasting a sequenced `message.new`
//! to every connected client, including the sender.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{MediaRef, MessageKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageCommand {
    pub conversation_id: Uuid,
    /// Local provisional id, echoed back for tracing only
    pub client_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_ref: Option<MediaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundCommand {
    #[serde(rename = "send-message")]
    SendMessage(SendMessageCommand),
    #[serde(rename = "mark-read", rename_all = "camelCase")]
    MarkRead { conversation_id: Uuid },
    #[serde(rename = "join-conversation", rename_all = "camelCase")]
    JoinConversation { conversation_id: Uuid },
    #[serde(rename = "typing-state", rename_all = "camelCase")]
    TypingState { conversation_id: Uuid, is_typing: bool },
    #[serde(rename = "unmatch", rename_all = "camelCase")]
    Unmatch { conversation_id: Uuid },
}

impl OutboundCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            OutboundCommand::SendMessage(_) => "send-message",
            OutboundCommand::MarkRead { .. } => "mark-read",
            OutboundCommand::JoinConversation { .. } => "join-conversation",
            OutboundCommand::TypingState { .. } => "typing-state",
            OutboundCommand::Unmatch { .. } => "unmatch",
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            OutboundCommand::SendMessage(cmd) => cmd.conversation_id,
            OutboundCommand::MarkRead { conversation_id }
            | OutboundCommand::JoinConversation { conversation_id }
            | OutboundCommand::TypingState {
                conversation_id, ..
            }
            | OutboundCommand::Unmatch { conversation_id } => *conversation_id,
        }
    }
}
