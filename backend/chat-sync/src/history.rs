//! Cold-load and backward pagination over HTTP
//!
//! `(conversationId, limit, beforeMessageId?) -> messages`, ordered oldest
//! to newest. The same record shape as `message.new` is returned.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use event_schema::{MessagePage, NewMessageEvent};

use crate::error::{HistoryError, HistoryResult};

#[async_trait]
pub trait HistoryClient: Send + Sync {
    /// Fetch up to `limit` messages strictly older than `before_message_id`,
    /// or the newest page when it is `None`
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        before_message_id: Option<&str>,
    ) -> HistoryResult<Vec<NewMessageEvent>>;
}

/// History client for the chat REST API
pub struct HttpHistoryClient {
    client: Client,
    base_url: String,
}

impl HttpHistoryClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl HistoryClient for HttpHistoryClient {
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        before_message_id: Option<&str>,
    ) -> HistoryResult<Vec<NewMessageEvent>> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.base_url, conversation_id
        );

        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(before) = before_message_id {
            query.push(("before", before.to_string()));
        }

        let response = self.client.get(&url).query(&query).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(HistoryError::Http(format!("{}: {}", status, body)));
        }

        let bytes = response.bytes().await?;
        let page: MessagePage = serde_json::from_slice(&bytes)?;

        debug!(
            conversation_id = %conversation_id,
            count = page.messages.len(),
            has_more = page.has_more,
            "Fetched history page"
        );
        Ok(page.messages)
    }
}

/// Scripted history source: the full server-side history per conversation
#[derive(Default)]
pub struct StaticHistory {
    conversations: HashMap<Uuid, Vec<NewMessageEvent>>,
}

impl StaticHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(mut self, conversation_id: Uuid, mut messages: Vec<NewMessageEvent>) -> Self {
        messages.sort_by_key(|m| m.sequence);
        self.conversations.insert(conversation_id, messages);
        self
    }
}

#[async_trait]
impl HistoryClient for StaticHistory {
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        before_message_id: Option<&str>,
    ) -> HistoryResult<Vec<NewMessageEvent>> {
        let Some(all) = self.conversations.get(&conversation_id) else {
            return Ok(Vec::new());
        };

        let end = match before_message_id {
            Some(id) => all
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| HistoryError::Http(format!("404: unknown message {}", id)))?,
            None => all.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(all[start..end].to_vec())
    }
}
