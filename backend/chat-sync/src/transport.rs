//! Realtime transport seam
//!
//! The socket itself lives outside this crate. The engine only needs a way
//! to send [`OutboundCommand`]s and a typed subscription to inbound
//! [`PushEvent`]s. Delivery is at-least-once and may be reordered within a
//! connection.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use event_schema::{OutboundCommand, PushEvent};

use crate::error::{TransportError, TransportResult};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand a command to the socket
    async fn send(&self, command: OutboundCommand) -> TransportResult<()>;

    /// Register for inbound events; dropping the subscription unregisters it
    fn subscribe(&self, buffer: usize) -> EventSubscription;
}

/// Typed handle on the inbound event stream
pub struct EventSubscription {
    id: Uuid,
    receiver: mpsc::Receiver<PushEvent>,
    unregister: Option<Box<dyn FnOnce(Uuid) + Send>>,
}

impl EventSubscription {
    pub fn new(
        receiver: mpsc::Receiver<PushEvent>,
        unregister: impl FnOnce(Uuid) + Send + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            receiver,
            unregister: Some(Box::new(unregister)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next inbound event; `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.receiver.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister(self.id);
        }
    }
}

type SubscriberMap = DashMap<Uuid, mpsc::Sender<PushEvent>>;

/// In-process transport backed by tokio channels.
///
/// Used by tests and the replay tool. Sent commands are recorded, and sends
/// can be made to fail.
#[derive(Default)]
pub struct ChannelTransport {
    subscribers: Arc<SubscriberMap>,
    sent: Mutex<Vec<OutboundCommand>>,
    failure: Mutex<Option<TransportError>>,
    send_attempts: AtomicUsize,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with `error`; `None` restores success
    pub async fn set_failure(&self, error: Option<TransportError>) {
        *self.failure.lock().await = error;
    }

    /// Commands accepted so far, in send order
    pub async fn sent_commands(&self) -> Vec<OutboundCommand> {
        self.sent.lock().await.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Push an event to every live subscriber. Returns how many received it.
    pub async fn deliver(&self, event: PushEvent) -> usize {
        let senders: Vec<(Uuid, mpsc::Sender<PushEvent>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, sender) in senders {
            if sender.send(event.clone()).await.is_ok() {
                delivered += 1;
            } else {
                self.subscribers.remove(&id);
                debug!(subscriber = %id, "Removed closed event subscriber");
            }
        }
        delivered
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, command: OutboundCommand) -> TransportResult<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().await.clone() {
            debug!(command = command.command_type(), error = %error, "Transport send failed");
            return Err(error);
        }
        self.sent.lock().await.push(command);
        Ok(())
    }

    fn subscribe(&self, buffer: usize) -> EventSubscription {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let registry = Arc::downgrade(&self.subscribers);

        let subscription = EventSubscription::new(receiver, move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id);
                debug!(subscriber = %id, "Event subscriber unregistered");
            }
        });
        self.subscribers.insert(subscription.id(), sender);
        subscription
    }
}
