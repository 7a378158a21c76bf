//! Prometheus counters for the sync engine

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    /// Push events applied to the projection, by wire event type
    pub static ref SYNC_EVENTS_APPLIED: IntCounterVec = register_int_counter_vec!(
        "chat_sync_events_applied_total",
        "Total number of push events applied to the projection",
        &["event_type"]
    )
    .expect("chat_sync_events_applied_total metric registration");

    /// Sequenced events dropped by the cursor check
    pub static ref SYNC_DUPLICATES_DROPPED: IntCounter = register_int_counter!(
        "chat_sync_duplicates_dropped_total",
        "Total number of duplicate message events dropped"
    )
    .expect("chat_sync_duplicates_dropped_total metric registration");

    pub static ref SYNC_PERSIST_FAILURES: IntCounter = register_int_counter!(
        "chat_sync_persist_failures_total",
        "Total number of durable store writes that failed"
    )
    .expect("chat_sync_persist_failures_total metric registration");

    pub static ref SYNC_UNMATCHED_MEDIA: IntCounter = register_int_counter!(
        "chat_sync_unmatched_media_total",
        "Total number of media events without a local message"
    )
    .expect("chat_sync_unmatched_media_total metric registration");

    /// Media events held until their message arrived
    pub static ref SYNC_MEDIA_PARKED: IntCounter = register_int_counter!(
        "chat_sync_media_parked_total",
        "Total number of media events parked before their message"
    )
    .expect("chat_sync_media_parked_total metric registration");

    pub static ref SYNC_PROVISIONAL_FAILED: IntCounter = register_int_counter!(
        "chat_sync_provisional_failed_total",
        "Total number of provisional sends marked failed"
    )
    .expect("chat_sync_provisional_failed_total metric registration");
}

pub fn record_applied(event_type: &str) {
    SYNC_EVENTS_APPLIED.with_label_values(&[event_type]).inc();
}
