//! Sync session lifecycle
//!
//! Explicit service context owning the projection, the reconciler, the
//! optimistic sender and the event pump. `init` on sign-in, `teardown` on
//! logout; `close` stops the pump and keeps durable data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use event_schema::{MessageReadEvent, OutboundCommand, PushEvent};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::history::HistoryClient;
use crate::models::{ConversationId, Draft, Message, UserId};
use crate::optimistic::OptimisticSender;
use crate::projection::{CacheKey, QueryCache, Subscription};
use crate::reconciler::{ApplyOutcome, EventReconciler, PageKind};
use crate::store::DurableStore;
use crate::transport::{EventSubscription, Transport};

/// Key/value entry naming the account the durable data belongs to
const LOCAL_USER_KEY: &str = "session.local_user";

pub struct SyncSession {
    config: SyncConfig,
    local_user: UserId,
    cache: Arc<QueryCache>,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryClient>,
    reconciler: Arc<EventReconciler>,
    sender: OptimisticSender,
    shutdown_tx: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SyncSession {
    /// Rehydrate from the durable store and start consuming push events
    pub async fn init(
        config: SyncConfig,
        local_user: UserId,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryClient>,
    ) -> SyncResult<Self> {
        config.validate()?;

        // durable data of another account is never shown
        let owner = local_user.to_string();
        match store.get_value(LOCAL_USER_KEY).await? {
            Some(previous) if previous != owner => {
                warn!(
                    previous_user = %previous,
                    local_user = %local_user,
                    "Durable store belongs to another account, wiping"
                );
                store.clear().await?;
                store.put_value(LOCAL_USER_KEY, &owner).await?;
            }
            Some(_) => {}
            None => store.put_value(LOCAL_USER_KEY, &owner).await?,
        }

        let cache = Arc::new(QueryCache::new());
        let reconciler = Arc::new(EventReconciler::new(
            local_user,
            cache.clone(),
            store.clone(),
            config.retention_window,
        ));
        let restored = reconciler.rehydrate().await?;

        let sender = OptimisticSender::new(
            local_user,
            cache.clone(),
            transport.clone(),
            config.provisional_timeout,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscription = transport.subscribe(config.event_buffer);
        let pump = tokio::spawn(run_event_pump(
            reconciler.clone(),
            subscription,
            shutdown_rx,
        ));

        info!(
            local_user = %local_user,
            conversations = restored,
            unread_total = cache.unread_total(),
            "Sync session started"
        );

        Ok(Self {
            config,
            local_user,
            cache,
            store,
            transport,
            history,
            reconciler,
            sender,
            shutdown_tx,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Read-only view of the projection
    pub fn projection(&self) -> &QueryCache {
        &self.cache
    }

    pub fn subscribe(&self, key: CacheKey) -> Subscription {
        self.cache.subscribe(key)
    }

    /// Last applied sequence of a conversation
    pub fn cursor(&self, conversation_id: ConversationId) -> Option<i64> {
        self.reconciler.cursor(conversation_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Show a message immediately and send it in the background
    pub fn send(&self, conversation_id: ConversationId, draft: Draft) -> SyncResult<Message> {
        self.ensure_open()?;
        if !self.cache.contains_conversation(conversation_id) {
            return Err(SyncError::UnknownConversation(conversation_id));
        }
        Ok(self.sender.create_provisional(conversation_id, draft))
    }

    pub fn retry_provisional(
        &self,
        conversation_id: ConversationId,
        provisional_id: &str,
    ) -> SyncResult<bool> {
        self.ensure_open()?;
        Ok(self.sender.retry_provisional(conversation_id, provisional_id))
    }

    pub fn discard_provisional(
        &self,
        conversation_id: ConversationId,
        provisional_id: &str,
    ) -> SyncResult<bool> {
        self.ensure_open()?;
        Ok(self.sender.discard_provisional(conversation_id, provisional_id))
    }

    /// Clear unread locally and tell the server
    pub async fn mark_read(&self, conversation_id: ConversationId) -> SyncResult<ApplyOutcome> {
        self.ensure_open()?;
        let outcome = self
            .reconciler
            .apply(PushEvent::MessageRead(MessageReadEvent {
                conversation_id,
                reader_id: self.local_user,
            }))
            .await;
        self.fire(OutboundCommand::MarkRead { conversation_id }).await;
        Ok(outcome)
    }

    pub async fn set_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> SyncResult<()> {
        self.ensure_open()?;
        self.fire(OutboundCommand::TypingState {
            conversation_id,
            is_typing,
        })
        .await;
        Ok(())
    }

    /// Join the conversation channel and cold-load the newest page when
    /// nothing is cached. Returns the number of fetched messages.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> SyncResult<usize> {
        self.ensure_open()?;
        self.fire(OutboundCommand::JoinConversation { conversation_id })
            .await;

        if self.cache.oldest_confirmed(conversation_id).is_some() {
            debug!(conversation_id = %conversation_id, "Conversation already cached");
            return Ok(0);
        }
        self.fetch_page(conversation_id, None, PageKind::Latest).await
    }

    /// Fetch the page before the oldest retained message. Returns the number
    /// of fetched messages; zero means the start of history was reached.
    pub async fn load_older(&self, conversation_id: ConversationId) -> SyncResult<usize> {
        self.ensure_open()?;
        match self.cache.oldest_confirmed(conversation_id) {
            Some(oldest) => {
                self.fetch_page(conversation_id, Some(&oldest.id), PageKind::Older)
                    .await
            }
            None => self.fetch_page(conversation_id, None, PageKind::Latest).await,
        }
    }

    /// Consume a media item locally (one-time photos are never revealed again)
    pub async fn mark_media_viewed(&self, media_id: &str) -> SyncResult<ApplyOutcome> {
        self.ensure_open()?;
        Ok(self.reconciler.apply_local_view(media_id).await)
    }

    pub async fn unmatch(&self, conversation_id: ConversationId) -> SyncResult<ApplyOutcome> {
        self.ensure_open()?;
        let outcome = self.reconciler.remove_conversation(conversation_id).await;
        self.fire(OutboundCommand::Unmatch { conversation_id }).await;
        Ok(outcome)
    }

    /// Apply an event directly, bypassing the transport (replays, tests)
    pub async fn apply_event(&self, event: PushEvent) -> SyncResult<ApplyOutcome> {
        self.ensure_open()?;
        Ok(self.reconciler.apply(event).await)
    }

    /// Stop the event pump; durable data is kept
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.pump.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event pump task ended abnormally");
            }
        }
        info!(local_user = %self.local_user, "Sync session closed");
    }

    /// Logout: stop the pump, drop the projection and wipe the durable store
    pub async fn teardown(&self) -> SyncResult<()> {
        self.close().await;
        self.reconciler.reset();
        self.store.clear().await?;
        info!(local_user = %self.local_user, "Sync session torn down");
        Ok(())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::SessionClosed);
        }
        Ok(())
    }

    /// Outbound commands are fire-and-forget; failures are logged only
    async fn fire(&self, command: OutboundCommand) {
        let command_type = command.command_type();
        let conversation_id = command.conversation_id();
        if let Err(e) = self.transport.send(command).await {
            warn!(
                command = command_type,
                conversation_id = %conversation_id,
                error = %e,
                "Outbound command failed"
            );
        }
    }

    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        before_message_id: Option<&str>,
        kind: PageKind,
    ) -> SyncResult<usize> {
        let page = self
            .history
            .fetch_messages(conversation_id, self.config.page_size, before_message_id)
            .await?;
        let fetched = page.len();

        let outcome = self
            .reconciler
            .apply_history_page(conversation_id, page, kind)
            .await;
        debug!(
            conversation_id = %conversation_id,
            fetched = fetched,
            outcome = ?outcome,
            "History page applied"
        );
        Ok(fetched)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Single sequential consumer of the transport subscription
async fn run_event_pump(
    reconciler: Arc<EventReconciler>,
    mut subscription: EventSubscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(subscriber = %subscription.id(), "Starting event pump");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping event pump");
                    break;
                }
            }

            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let event_type = event.event_type();
                        let conversation_id = event.conversation_id();
                        let outcome = reconciler.apply(event).await;
                        debug!(
                            event_type = event_type,
                            conversation_id = ?conversation_id,
                            outcome = ?outcome,
                            "Push event handled"
                        );
                    }
                    None => {
                        warn!("Transport event stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!("Event pump stopped");
}
