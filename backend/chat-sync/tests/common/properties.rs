//! Behavior every durable store backend must preserve. Each scenario takes
//! the store under test and is run once per backend.

use super::*;
use chat_sync::{ApplyOutcome, Draft, SendState};
use event_schema::{
    MediaReadyEvent, MediaRef, MessageKind, ProcessingStatus, ReceiverStatus, ViewMode,
};

pub async fn redelivered_message_is_applied_once(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let h = Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;

    h.deliver(match_created(&ids, 0)).await;
    h.deliver(message_new(&ids, 1, ids.peer)).await;
    h.deliver(message_new(&ids, 1, ids.peer)).await;
    h.settle().await;

    let projection = h.session.projection();
    assert_eq!(projection.messages(ids.conversation_id).len(), 1);
    assert_eq!(projection.unread_total(), 1);
    assert_eq!(
        projection.conversation(ids.conversation_id).unwrap().unread_count,
        1
    );
    assert_eq!(store.load_messages(ids.conversation_id).await.unwrap().len(), 1);
    assert_eq!(
        store.load_conversations().await.unwrap()[0].unread_count,
        1
    );
}

pub async fn out_of_order_delivery_keeps_high_water_mark(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let h = Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;

    for seq in [5, 3, 7, 7, 6] {
        h.deliver(message_new(&ids, seq, ids.peer)).await;
    }
    h.settle().await;

    assert_eq!(h.session.cursor(ids.conversation_id), Some(7));
    assert_eq!(h.sequences(ids.conversation_id), vec![5, 6, 7]);
    assert_eq!(
        store.load_cursors().await.unwrap().get(&ids.conversation_id),
        Some(&7)
    );
    let stored: Vec<i64> = store
        .load_messages(ids.conversation_id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.sequence)
        .collect();
    assert_eq!(stored, vec![5, 6, 7]);

    // placeholder conversation created from the first message
    let conversation = h.session.projection().conversation(ids.conversation_id).unwrap();
    assert_eq!(conversation.unread_count, 3);
    assert_eq!(conversation.last_message.as_deref(), Some("message 7"));
}

pub async fn optimistic_send_is_replaced_by_echo(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let h = Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;
    h.deliver(match_created(&ids, 0)).await;
    h.settle().await;

    let provisional = h
        .session
        .send(ids.conversation_id, Draft::Text("message 1".into()))
        .unwrap();
    assert!(provisional.is_provisional());
    assert_eq!(
        h.session.projection().provisional_messages(ids.conversation_id).len(),
        1
    );

    let sent = h.wait_for_sent(1).await;
    match &sent[0] {
        OutboundCommand::SendMessage(cmd) => {
            assert_eq!(cmd.client_id, provisional.id);
            assert_eq!(cmd.content.as_deref(), Some("message 1"));
        }
        other => panic!("unexpected command {:?}", other),
    }
    // nothing provisional reaches the durable store
    assert!(store
        .load_messages(ids.conversation_id)
        .await
        .unwrap()
        .is_empty());

    h.deliver(message_new(&ids, 1, ids.me)).await;
    h.settle().await;

    let projection = h.session.projection();
    assert!(projection.provisional_messages(ids.conversation_id).is_empty());
    let messages = projection.messages(ids.conversation_id);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sequence, 1);
    assert_eq!(messages[0].send_state, SendState::Confirmed);
    assert_eq!(projection.unread_total(), 0);

    let stored = store.load_messages(ids.conversation_id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "m1");
    assert_eq!(stored[0].send_state, SendState::Confirmed);
}

pub async fn self_read_clears_exactly_that_conversation(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let other = ids.other_conversation();
    let h = Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;

    for seq in 1..=5 {
        h.deliver(message_new(&ids, seq, ids.peer)).await;
    }
    for seq in 1..=2 {
        h.deliver(message_new(&other, seq, other.peer)).await;
    }
    h.settle().await;
    let before = h.session.projection().unread_total();
    assert_eq!(before, 7);

    let outcome = h.session.mark_read(ids.conversation_id).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied);

    let projection = h.session.projection();
    assert_eq!(projection.conversation(ids.conversation_id).unwrap().unread_count, 0);
    assert_eq!(projection.unread_total(), before - 5);
    assert_eq!(projection.conversation(other.conversation_id).unwrap().unread_count, 2);

    let stored = store.load_conversations().await.unwrap();
    let unread = |id: Uuid| stored.iter().find(|c| c.id == id).unwrap().unread_count;
    assert_eq!(unread(ids.conversation_id), 0);
    assert_eq!(unread(other.conversation_id), 2);

    assert_eq!(
        h.transport.sent_commands().await,
        vec![OutboundCommand::MarkRead {
            conversation_id: ids.conversation_id
        }]
    );
}

pub async fn eviction_then_pagination_round_trip(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let config = SyncConfig {
        retention_window: 20,
        page_size: 30,
        ..test_config()
    };
    let history =
        || StaticHistory::new().with_messages(ids.conversation_id, server_history(&ids, 100));

    let first = Harness::start(config.clone(), ids.me, store.clone(), history()).await;
    first.deliver(match_created(&ids, 0)).await;
    first.settle().await;

    assert_eq!(first.session.open_conversation(ids.conversation_id).await.unwrap(), 30);
    assert_eq!(first.sequences(ids.conversation_id), (71..=100).collect::<Vec<_>>());
    assert_eq!(first.session.cursor(ids.conversation_id), Some(100));

    let retained: Vec<i64> = store
        .load_messages(ids.conversation_id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.sequence)
        .collect();
    assert_eq!(retained, (81..=100).collect::<Vec<_>>());
    first.session.close().await;

    // restart: only the retained window is local
    let second = Harness::start(config, ids.me, store.clone(), history()).await;
    assert_eq!(second.sequences(ids.conversation_id), retained);
    let oldest = second
        .session
        .projection()
        .oldest_confirmed(ids.conversation_id)
        .unwrap();
    assert_eq!(oldest.id, "m81");

    assert_eq!(second.session.load_older(ids.conversation_id).await.unwrap(), 30);
    assert_eq!(
        second.sequences(ids.conversation_id),
        (51..=100).collect::<Vec<_>>()
    );

    // a replay of a retained message is still a duplicate
    let outcome = second
        .session
        .apply_event(message_new(&ids, 90, ids.peer))
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Duplicate);
}

fn photo_message(ids: &Ids, sequence: i64, media: MediaRef) -> PushEvent {
    let mut photo = text_message(ids, sequence, ids.peer);
    photo.kind = MessageKind::Photo;
    photo.content = None;
    photo.media_ref = Some(media);
    PushEvent::MessageNew(photo)
}

fn media_ready(ids: &Ids, media_id: &str) -> PushEvent {
    PushEvent::MediaReady(MediaReadyEvent {
        media_id: media_id.to_string(),
        conversation_id: ids.conversation_id,
        processing_status: ProcessingStatus::Completed,
        receiver_status: ReceiverStatus::Accepted,
        moderation_result: Some("clean".to_string()),
        url: Some(format!("https://cdn.example/{}.jpg", media_id)),
    })
}

pub async fn one_time_photo_stays_consumed(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let h = Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;

    h.deliver(photo_message(
        &ids,
        1,
        MediaRef {
            id: "media-1".to_string(),
            url: Some("https://cdn.example/media-1.jpg".to_string()),
            processing_status: ProcessingStatus::Completed,
            receiver_status: ReceiverStatus::Accepted,
            view_mode: ViewMode::OneTime { duration_secs: 10 },
            viewed: false,
            is_reel: false,
        },
    ))
    .await;
    h.settle().await;

    let media = |h: &Harness| {
        h.session.projection().messages(ids.conversation_id)[0]
            .media
            .clone()
            .unwrap()
    };
    assert!(media(&h).is_revealable());

    assert_eq!(
        h.session.mark_media_viewed("media-1").await.unwrap(),
        ApplyOutcome::Applied
    );

    h.deliver(media_ready(&ids, "media-1")).await;
    h.deliver(media_ready(&ids, "media-1")).await;
    h.settle().await;

    let viewed = media(&h);
    assert!(viewed.viewed);
    assert!(viewed.url.is_none());
    assert!(!viewed.is_revealable());

    let stored = store.load_messages(ids.conversation_id).await.unwrap();
    let stored_media = stored[0].media.as_ref().unwrap();
    assert!(stored_media.viewed);
    assert!(stored_media.url.is_none());
    assert!(stored_media.is_one_time());
    h.session.close().await;

    // the consumed state also survives a restart
    let restarted =
        Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;
    assert!(!media(&restarted).is_revealable());
    assert!(media(&restarted).viewed);
}

pub async fn media_ready_before_message_is_kept(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let h = Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;

    let outcome = h
        .session
        .apply_event(media_ready(&ids, "media-2"))
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Deferred);

    h.deliver(photo_message(
        &ids,
        1,
        MediaRef {
            id: "media-2".to_string(),
            url: None,
            processing_status: ProcessingStatus::Processing,
            receiver_status: ReceiverStatus::Pending,
            view_mode: ViewMode::Unlimited,
            viewed: false,
            is_reel: false,
        },
    ))
    .await;
    h.settle().await;

    let media = h.session.projection().messages(ids.conversation_id)[0]
        .media
        .clone()
        .unwrap();
    assert_eq!(media.processing_status, ProcessingStatus::Completed);
    assert_eq!(media.url.as_deref(), Some("https://cdn.example/media-2.jpg"));

    let stored = store.load_messages(ids.conversation_id).await.unwrap();
    let stored_media = stored[0].media.as_ref().unwrap();
    assert_eq!(stored_media.processing_status, ProcessingStatus::Completed);
    assert!(stored_media.is_revealable());
}

pub async fn redelivery_after_unmatch_is_dropped(store: Arc<dyn DurableStore>) {
    let ids = Ids::new();
    let h = Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;

    h.deliver(match_created(&ids, 0)).await;
    h.deliver(message_new(&ids, 1, ids.peer)).await;
    h.settle().await;

    assert_eq!(
        h.session.unmatch(ids.conversation_id).await.unwrap(),
        ApplyOutcome::Applied
    );
    h.deliver(message_new(&ids, 1, ids.peer)).await;
    h.settle().await;

    let projection = h.session.projection();
    assert!(projection.conversation(ids.conversation_id).is_none());
    assert_eq!(projection.unread_total(), 0);
    assert!(store.load_conversations().await.unwrap().is_empty());
    assert!(store.load_messages(ids.conversation_id).await.unwrap().is_empty());
    h.session.close().await;

    let restarted =
        Harness::start(test_config(), ids.me, store.clone(), StaticHistory::new()).await;
    assert_eq!(
        restarted
            .session
            .apply_event(message_new(&ids, 1, ids.peer))
            .await
            .unwrap(),
        ApplyOutcome::Duplicate
    );
    assert!(restarted.session.projection().conversations().is_empty());
}
