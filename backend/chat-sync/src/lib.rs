//! Client-side realtime sync and offline cache engine for chat.
//!
//! Keeps three stores consistent: the live push-event stream, the in-memory
//! projection the UI reads, and the durable on-device store.

pub mod config;
pub mod counters;
pub mod cursor;
pub mod error;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod optimistic;
mod parked_media;
pub mod projection;
pub mod reconciler;
pub mod session;
pub mod store;
mod tombstones;
pub mod transport;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use models::{Conversation, ConversationId, Draft, MediaDescriptor, Message, SendState, UserId};
pub use projection::{CacheKey, CacheValue, QueryCache, Subscription};
pub use reconciler::{ApplyOutcome, EventReconciler};
pub use session::SyncSession;
