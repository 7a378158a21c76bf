use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// sqlx connection URL of the on-device store
    pub database_url: String,
    /// Most recent N confirmed messages kept per conversation in the durable store
    pub retention_window: usize,
    /// Page size used for cold loads and backward pagination
    pub page_size: usize,
    /// Provisional sends not confirmed within this window are marked failed
    pub provisional_timeout: Option<Duration>,
    /// Buffer of the transport event subscription
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://chat-sync.db".to_string(),
            retention_window: 50,
            page_size: 30,
            provisional_timeout: Some(Duration::from_secs(30)),
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, SyncError> {
        match env::var(name) {
            Ok(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| SyncError::Config(format!("{name} is not a valid value: {raw}"))),
            Err(_) => Ok(None),
        }
    }

    pub fn from_env() -> Result<Self, SyncError> {
        dotenv().ok();
        let defaults = Self::default();

        let database_url =
            env::var("CHAT_SYNC_DATABASE_URL").unwrap_or(defaults.database_url);
        let retention_window = Self::parse_var("CHAT_SYNC_RETENTION_WINDOW")?
            .unwrap_or(defaults.retention_window);
        let page_size = Self::parse_var("CHAT_SYNC_PAGE_SIZE")?.unwrap_or(defaults.page_size);
        let event_buffer =
            Self::parse_var("CHAT_SYNC_EVENT_BUFFER")?.unwrap_or(defaults.event_buffer);

        // 0 disables the provisional timeout
        let provisional_timeout = match Self::parse_var::<u64>("CHAT_SYNC_PROVISIONAL_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.provisional_timeout,
        };

        let config = Self {
            database_url,
            retention_window,
            page_size,
            provisional_timeout,
            event_buffer,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.retention_window == 0 {
            return Err(SyncError::Config(
                "retention window must hold at least one message".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page size must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event buffer must be positive".into()));
        }
        Ok(())
    }
}
