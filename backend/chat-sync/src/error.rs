use thiserror::Error;
use uuid::Uuid;

pub type SyncResult<T> = Result<T, SyncError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Durable store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded back into a model
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Realtime transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("send timed out")]
    Timeout,
}

/// Cold-load / pagination failures
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("http error: {0}")]
    Http(String),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for HistoryError {
    fn from(e: reqwest::Error) -> Self {
        HistoryError::Http(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("session closed")]
    SessionClosed,

    #[error("unknown conversation: {0}")]
    UnknownConversation(Uuid),
}

impl SyncError {
    /// Returns whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store(StoreError::Database(e)) => {
                matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
            }
            SyncError::Store(StoreError::Unavailable(_)) => true,
            SyncError::Transport(TransportError::Timeout | TransportError::Closed) => true,
            SyncError::History(HistoryError::Http(_)) => true,
            _ => false,
        }
    }
}
