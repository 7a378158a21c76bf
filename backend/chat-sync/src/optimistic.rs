//! Optimistic message manager
//!
//! A user send is shown immediately as a provisional record (non-positive
//! sequence, `local-` id) while the command goes out in the background. The
//! reconciler removes provisional records once the confirmed echo arrives.
//!
//! Provisional records live in the projection only and are never persisted.
//! A send the transport rejects, or one not confirmed within the configured
//! timeout, is flagged [`SendState::Failed`]; the user may retry or discard it.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

use event_schema::{OutboundCommand, SendMessageCommand};

use crate::metrics::SYNC_PROVISIONAL_FAILED;
use crate::models::{ConversationId, Draft, Message, SendState, UserId, PROVISIONAL_ID_PREFIX};
use crate::projection::QueryCache;
use crate::transport::Transport;

pub struct OptimisticSender {
    local_user: UserId,
    cache: Arc<QueryCache>,
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
    /// Runtime background sends are spawned on; UI threads may call in
    /// without one of their own
    runtime: Handle,
    next_marker: AtomicI64,
    /// Current send attempt per provisional id; stale timers compare against it
    attempts: Arc<DashMap<String, u64>>,
    attempt_seq: AtomicU64,
}

impl OptimisticSender {
    /// Must be created inside a Tokio runtime; sends are spawned on it.
    pub fn new(
        local_user: UserId,
        cache: Arc<QueryCache>,
        transport: Arc<dyn Transport>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            local_user,
            cache,
            transport,
            timeout,
            runtime: Handle::current(),
            next_marker: AtomicI64::new(0),
            attempts: Arc::new(DashMap::new()),
            attempt_seq: AtomicU64::new(0),
        }
    }

    /// Insert a provisional record and send it in the background.
    ///
    /// Returns without waiting for the network. Safe to call from threads
    /// outside the runtime.
    pub fn create_provisional(&self, conversation_id: ConversationId, draft: Draft) -> Message {
        let kind = draft.kind();
        let (content, media) = draft.into_parts();

        let message = Message {
            id: format!("{}{}", PROVISIONAL_ID_PREFIX, Uuid::new_v4()),
            sequence: self.next_marker.fetch_sub(1, Ordering::SeqCst),
            conversation_id,
            sender_id: self.local_user,
            kind,
            content,
            media,
            delivered: false,
            read: false,
            created_at: Utc::now(),
            send_state: SendState::Pending,
        };

        self.cache
            .update_messages(conversation_id, |list| list.push(message.clone()));
        debug!(
            conversation_id = %conversation_id,
            provisional_id = %message.id,
            sequence = message.sequence,
            "Provisional message created"
        );

        self.dispatch(&message);
        message
    }

    /// Re-send a failed provisional record under the same local id
    pub fn retry_provisional(&self, conversation_id: ConversationId, provisional_id: &str) -> bool {
        let retried = self
            .cache
            .update_existing_messages(conversation_id, |list| {
                list.iter_mut()
                    .find(|m| {
                        m.id == provisional_id
                            && m.is_provisional()
                            && m.send_state == SendState::Failed
                    })
                    .map(|m| {
                        m.send_state = SendState::Pending;
                        m.clone()
                    })
            })
            .flatten();

        match retried {
            Some(message) => {
                debug!(provisional_id = %provisional_id, "Retrying provisional message");
                self.dispatch(&message);
                true
            }
            None => false,
        }
    }

    /// Remove a provisional record the user gave up on
    pub fn discard_provisional(
        &self,
        conversation_id: ConversationId,
        provisional_id: &str,
    ) -> bool {
        let removed = self
            .cache
            .update_existing_messages(conversation_id, |list| {
                let before = list.len();
                list.retain(|m| !(m.is_provisional() && m.id == provisional_id));
                before != list.len()
            })
            .unwrap_or(false);

        if removed {
            self.attempts.remove(provisional_id);
            debug!(provisional_id = %provisional_id, "Provisional message discarded");
        }
        removed
    }

    fn dispatch(&self, message: &Message) {
        let command = OutboundCommand::SendMessage(SendMessageCommand {
            conversation_id: message.conversation_id,
            client_id: message.id.clone(),
            kind: message.kind,
            content: message.content.clone(),
            media_ref: message.media.as_ref().map(|m| m.to_wire()),
        });

        let attempt = self.attempt_seq.fetch_add(1, Ordering::SeqCst);
        self.attempts.insert(message.id.clone(), attempt);

        let cache = self.cache.clone();
        let transport = self.transport.clone();
        let attempts = self.attempts.clone();
        let timeout = self.timeout;
        let conversation_id = message.conversation_id;
        let provisional_id = message.id.clone();

        self.runtime.spawn(async move {
            if let Err(e) = transport.send(command).await {
                warn!(
                    conversation_id = %conversation_id,
                    provisional_id = %provisional_id,
                    error = %e,
                    "Send rejected by transport"
                );
                mark_failed(&cache, conversation_id, &provisional_id);
                attempts.remove_if(&provisional_id, |_, a| *a == attempt);
                return;
            }

            let Some(timeout) = timeout else {
                attempts.remove_if(&provisional_id, |_, a| *a == attempt);
                return;
            };
            tokio::time::sleep(timeout).await;

            let current = attempts.get(&provisional_id).map(|a| *a);
            if current != Some(attempt) {
                return;
            }
            if mark_failed(&cache, conversation_id, &provisional_id) {
                warn!(
                    conversation_id = %conversation_id,
                    provisional_id = %provisional_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "Provisional message not confirmed in time"
                );
            }
            attempts.remove_if(&provisional_id, |_, a| *a == attempt);
        });
    }
}

/// Flag a still-pending provisional record as failed
fn mark_failed(cache: &QueryCache, conversation_id: ConversationId, provisional_id: &str) -> bool {
    let failed = cache
        .update_existing_messages(conversation_id, |list| {
            list.iter_mut()
                .find(|m| {
                    m.id == provisional_id
                        && m.is_provisional()
                        && m.send_state == SendState::Pending
                })
                .map(|m| m.send_state = SendState::Failed)
                .is_some()
        })
        .unwrap_or(false);

    if failed {
        SYNC_PROVISIONAL_FAILED.inc();
    }
    failed
}
