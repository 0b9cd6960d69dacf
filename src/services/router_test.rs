use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::db::Store;
use crate::db::memory::MemoryStore;
use crate::state::BanRecord;
use crate::state::test_helpers::{self, assert_no_event_named, drain, join_session, recv_named};

fn chat_send(text: &str) -> ClientEvent {
    ClientEvent::ChatSend { text: text.into(), color: None, avatar: None, avatar_image: None }
}

fn seeded_message(id: &str) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        user: "Ann".into(),
        text: "hi".into(),
        color: DEFAULT_COLOR.into(),
        time: 1,
        uid: "v1".into(),
        avatar: DEFAULT_AVATAR.into(),
        avatar_image: None,
        reactions: Reactions::new(),
    }
}

// =============================================================================
// chat:send
// =============================================================================

#[tokio::test]
async fn chat_send_reaches_every_session_including_sender() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;
    drain(&mut ann_rx).await;

    dispatch(&state, &ann, chat_send("hi")).await;

    let ServerEvent::ChatMessage(to_ann) = recv_named(&mut ann_rx, "chat:message").await else {
        unreachable!();
    };
    let ServerEvent::ChatMessage(to_bob) = recv_named(&mut bob_rx, "chat:message").await else {
        unreachable!();
    };
    assert_eq!(to_ann, to_bob);
    assert_eq!(to_ann.user, "Ann");
    assert_eq!(to_ann.text, "hi");
    assert_eq!(to_ann.uid, "v1");
    assert_eq!(to_ann.color, DEFAULT_COLOR);
    assert_eq!(to_ann.avatar, DEFAULT_AVATAR);
    assert!(to_ann.avatar_image.is_none());
    assert!(to_ann.reactions.is_empty());
}

#[tokio::test]
async fn chat_send_keeps_client_styling() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    let event = ClientEvent::ChatSend {
        text: "hi".into(),
        color: Some("#ff0000".into()),
        avatar: Some("🐱".into()),
        avatar_image: Some("https://img.example/cat.png".into()),
    };
    dispatch(&state, &ann, event).await;

    let ServerEvent::ChatMessage(message) = recv_named(&mut ann_rx, "chat:message").await else {
        unreachable!();
    };
    assert_eq!(message.color, "#ff0000");
    assert_eq!(message.avatar, "🐱");
    assert_eq!(message.avatar_image.as_deref(), Some("https://img.example/cat.png"));
}

#[tokio::test]
async fn chat_send_is_persisted() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch(&state, &ann, chat_send("hello")).await;
    let ServerEvent::ChatMessage(sent) = recv_named(&mut ann_rx, "chat:message").await else {
        unreachable!();
    };

    let stored = test_helpers::eventually(|| {
        let store = store.clone();
        async move { !store.recent_chat_messages(10).await.unwrap_or_default().is_empty() }
    })
    .await;
    assert!(stored);
    let recent = store.recent_chat_messages(10).await.expect("recent");
    assert_eq!(recent[0], sent);
}

#[tokio::test]
async fn chat_send_broadcasts_even_when_persistence_is_unavailable() {
    let mut state = test_helpers::test_app_state();
    let (closed_tx, closed_rx) = tokio::sync::mpsc::channel(1);
    drop(closed_rx);
    state.persist_tx = Some(closed_tx);
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;

    dispatch(&state, &ann, chat_send("still here")).await;

    recv_named(&mut ann_rx, "chat:message").await;
    recv_named(&mut bob_rx, "chat:message").await;
}

#[tokio::test]
async fn chat_send_clears_sender_typing_and_rebroadcasts_view() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;

    dispatch(&state, &ann, ClientEvent::ChatTyping {}).await;
    assert_eq!(recv_named(&mut bob_rx, "chat:typing").await, ServerEvent::ChatTyping(vec!["Ann".into()]));

    dispatch(&state, &ann, chat_send("done typing")).await;
    recv_named(&mut bob_rx, "chat:message").await;
    assert_eq!(recv_named(&mut bob_rx, "chat:typing").await, ServerEvent::ChatTyping(vec![]));
    drain(&mut ann_rx).await;
    assert_eq!(state.presence.typing_markers(), 0);
}

#[tokio::test]
async fn banned_sender_gets_one_error_and_nobody_gets_the_message() {
    let store = Arc::new(MemoryStore::new());
    store.insert_ban(BanRecord { visitor_id: "v1".into(), reason: Some("spam".into()), expires_at: None });
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;
    drain(&mut ann_rx).await;

    dispatch(&state, &ann, chat_send("spam")).await;

    let events = drain(&mut ann_rx).await;
    let errors: Vec<&ServerEvent> = events.iter().filter(|e| e.name() == "chat:error").collect();
    assert_eq!(errors, vec![&ServerEvent::ChatError { message: BANNED_MESSAGE.into() }]);
    assert!(events.iter().all(|e| e.name() != "chat:message"));
    assert_no_event_named(&mut bob_rx, "chat:message").await;
    assert_no_event_named(&mut bob_rx, "chat:error").await;
    assert!(store.recent_chat_messages(10).await.expect("recent").is_empty());
}

#[tokio::test]
async fn expired_ban_does_not_block() {
    let store = Arc::new(MemoryStore::new());
    store.insert_ban(BanRecord { visitor_id: "v1".into(), reason: None, expires_at: Some(now_ms() - 1) });
    let state = test_helpers::test_app_state_with_store(store);
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch(&state, &ann, chat_send("back")).await;
    recv_named(&mut ann_rx, "chat:message").await;
}

#[tokio::test]
async fn ban_lookup_failure_rejects_with_generic_error() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;
    drain(&mut ann_rx).await;

    store.set_failing(true);
    dispatch(&state, &ann, chat_send("hi")).await;

    assert_eq!(
        recv_named(&mut ann_rx, "chat:error").await,
        ServerEvent::ChatError { message: SEND_FAILED_MESSAGE.into() }
    );
    assert_no_event_named(&mut bob_rx, "chat:message").await;
}

#[tokio::test]
async fn blank_chat_text_is_dropped() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch(&state, &ann, chat_send("   ")).await;
    assert_no_event_named(&mut ann_rx, "chat:message").await;
}

#[tokio::test]
async fn chat_text_is_masked_before_broadcast() {
    let store = Arc::new(MemoryStore::new());
    store.set_profanity_words(&["darn"]);
    let state = test_helpers::test_app_state_with_store(store);
    state.moderation.refresh_profanity().await.expect("refresh");
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch(&state, &ann, chat_send("Darn it")).await;
    let ServerEvent::ChatMessage(message) = recv_named(&mut ann_rx, "chat:message").await else {
        unreachable!();
    };
    assert_eq!(message.text, "**** it");
}

// =============================================================================
// chat:reaction
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reactions_from_many_sessions_are_all_counted() {
    let store = Arc::new(MemoryStore::new());
    store.insert_chat_message(&seeded_message("m1")).await.expect("seed");
    let state = test_helpers::test_app_state_with_store(store.clone());

    let mut sessions = Vec::new();
    for i in 0..5 {
        sessions.push(join_session(&state, &format!("v{i}"), "Guest").await);
    }

    let mut handles = Vec::new();
    for (ctx, _rx) in &sessions {
        for _ in 0..4 {
            let state = state.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let event = ClientEvent::ChatReaction { message_id: "m1".into(), emoji: "👍".into() };
                dispatch(&state, &ctx, event).await;
            }));
        }
    }
    for handle in handles {
        handle.await.expect("reaction task");
    }

    let recent = store.recent_chat_messages(1).await.expect("recent");
    assert_eq!(recent[0].reactions.get("👍"), Some(&20));

    let (_ctx, rx) = &mut sessions[0];
    let counts: Vec<i64> = drain(rx)
        .await
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ChatReaction { reactions, .. } => reactions.get("👍").copied(),
            _ => None,
        })
        .collect();
    assert_eq!(counts.len(), 20);
    assert_eq!(counts.iter().max(), Some(&20));
}

#[tokio::test]
async fn reactions_right_after_send_count_against_the_new_message() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;

    dispatch(&state, &ann, chat_send("react to me")).await;
    let ServerEvent::ChatMessage(message) = recv_named(&mut bob_rx, "chat:message").await else {
        unreachable!();
    };

    for _ in 0..3 {
        let event = ClientEvent::ChatReaction { message_id: message.id.clone(), emoji: "🎉".into() };
        dispatch(&state, &bob, event).await;
    }

    let mut counts = Vec::new();
    for _ in 0..3 {
        let ServerEvent::ChatReaction { message_id, reactions } = recv_named(&mut ann_rx, "chat:reaction").await else {
            unreachable!();
        };
        assert_eq!(message_id, message.id);
        counts.push(reactions.get("🎉").copied());
    }
    assert_eq!(counts, vec![Some(1), Some(2), Some(3)]);

    let recent = store.recent_chat_messages(1).await.expect("recent");
    assert_eq!(recent[0].reactions.get("🎉"), Some(&3));
}

#[tokio::test]
async fn reaction_on_unknown_message_is_dropped() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    let event = ClientEvent::ChatReaction { message_id: "missing".into(), emoji: "👍".into() };
    dispatch(&state, &ann, event).await;
    assert_no_event_named(&mut ann_rx, "chat:reaction").await;
}

// =============================================================================
// chat:typing
// =============================================================================

#[tokio::test]
async fn expired_typing_marker_is_excluded_from_next_broadcast() {
    let state = test_helpers::test_app_state();
    let (ann, _ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;

    let stale = now_ms() - state.config.typing_ttl_ms - 1;
    state.presence.set_typing("v9", "Ghost", stale);

    dispatch(&state, &ann, ClientEvent::ChatTyping {}).await;
    assert_eq!(recv_named(&mut bob_rx, "chat:typing").await, ServerEvent::ChatTyping(vec!["Ann".into()]));
    assert_eq!(state.presence.typing_markers(), 2, "view filters before the sweep deletes");
}

#[tokio::test]
async fn stop_typing_broadcasts_to_sender_too() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch(&state, &ann, ClientEvent::ChatTyping {}).await;
    recv_named(&mut ann_rx, "chat:typing").await;
    dispatch(&state, &ann, ClientEvent::ChatStopTyping {}).await;
    assert_eq!(recv_named(&mut ann_rx, "chat:typing").await, ServerEvent::ChatTyping(vec![]));
}

// =============================================================================
// canvas
// =============================================================================

#[tokio::test]
async fn stroke_reaches_everyone_but_sender() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;
    drain(&mut ann_rx).await;

    let event = ClientEvent::CanvasStroke { id: "s1".into(), stroke_data: json!({ "points": [[0, 0], [1, 1]] }) };
    dispatch(&state, &ann, event).await;

    assert_eq!(
        recv_named(&mut bob_rx, "canvas:stroke").await,
        ServerEvent::CanvasStroke(Stroke { id: "s1".into(), stroke_data: json!({ "points": [[0, 0], [1, 1]] }) })
    );
    assert_no_event_named(&mut ann_rx, "canvas:stroke").await;
    assert_eq!(state.canvas.list_strokes().len(), 1);
}

#[tokio::test]
async fn stroke_without_payload_is_dropped() {
    let state = test_helpers::test_app_state();
    let (ann, _ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;

    dispatch(&state, &ann, ClientEvent::CanvasStroke { id: "s1".into(), stroke_data: Value::Null }).await;
    dispatch(&state, &ann, ClientEvent::CanvasStroke { id: String::new(), stroke_data: json!(1) }).await;

    assert_no_event_named(&mut bob_rx, "canvas:stroke").await;
    assert!(state.canvas.list_strokes().is_empty());
}

#[tokio::test]
async fn clear_reaches_everyone_and_empties_the_next_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    for i in 0..3 {
        let event = ClientEvent::CanvasStroke { id: format!("s{i}"), stroke_data: json!(i) };
        dispatch(&state, &ann, event).await;
    }

    dispatch(&state, &ann, ClientEvent::CanvasClear {}).await;
    let ServerEvent::CanvasClear(marker) = recv_named(&mut ann_rx, "canvas:clear").await else {
        unreachable!();
    };
    assert_eq!(marker.cleared_by, "v1");
    assert_eq!(marker.generation, 1);

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    crate::services::session::join(&state, tx, "v2".into(), "Bob".into()).await;
    assert_eq!(recv_named(&mut rx, "canvas:initial").await, ServerEvent::CanvasInitial(vec![]));

    let persisted = test_helpers::eventually(|| {
        let store = store.clone();
        async move {
            store.last_clear().await.ok().flatten().is_some() && store.list_strokes().await.is_ok_and(|s| s.is_empty())
        }
    })
    .await;
    assert!(persisted);
}

#[tokio::test]
async fn cursor_updates_skip_sender() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;
    drain(&mut ann_rx).await;

    let event = ClientEvent::CanvasCursor { user_id: "v1".into(), cursor_data: json!({ "x": 3, "y": 4 }) };
    dispatch(&state, &ann, event).await;
    assert_eq!(
        recv_named(&mut bob_rx, "canvas:cursor").await,
        ServerEvent::CanvasCursor { user_id: "v1".into(), cursor_data: json!({ "x": 3, "y": 4 }) }
    );

    dispatch(&state, &ann, ClientEvent::CanvasCursorRemove { user_id: "v1".into() }).await;
    assert_eq!(
        recv_named(&mut bob_rx, "canvas:cursor:remove").await,
        ServerEvent::CanvasCursorRemove { user_id: "v1".into() }
    );
    assert_no_event_named(&mut ann_rx, "canvas:cursor").await;
    assert!(state.canvas.take_cursors(ann.session_id).is_empty());
}

// =============================================================================
// friends
// =============================================================================

#[tokio::test]
async fn friend_request_reaches_every_tab_of_target_and_echoes_sender() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob_a, mut bob_a_rx) = join_session(&state, "v2", "Bob").await;
    let (_bob_b, mut bob_b_rx) = join_session(&state, "v2", "Bob").await;
    let (_cy, mut cy_rx) = join_session(&state, "v3", "Cy").await;

    let event = ClientEvent::FriendRequest { from_user_id: "v1".into(), to_user_id: "v2".into() };
    dispatch(&state, &ann, event).await;

    let expected = ServerEvent::FriendRequestReceived { from_user_id: "v1".into(), to_user_id: "v2".into() };
    assert_eq!(recv_named(&mut bob_a_rx, "friend:request:received").await, expected);
    assert_eq!(recv_named(&mut bob_b_rx, "friend:request:received").await, expected);
    assert_eq!(
        recv_named(&mut ann_rx, "friend:request:sent").await,
        ServerEvent::FriendRequestSent { from_user_id: "v1".into(), to_user_id: "v2".into() }
    );
    assert_no_event_named(&mut cy_rx, "friend:request:received").await;
}

#[tokio::test]
async fn friend_request_to_offline_visitor_still_echoes_sender() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    let event = ClientEvent::FriendRequest { from_user_id: "v1".into(), to_user_id: "nobody".into() };
    dispatch(&state, &ann, event).await;
    recv_named(&mut ann_rx, "friend:request:sent").await;
}

#[tokio::test]
async fn friend_added_notifies_both_sides_with_mirrored_ids() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;
    let (_bob, mut bob_rx) = join_session(&state, "v2", "Bob").await;

    dispatch(&state, &ann, ClientEvent::FriendAdded { user_id: "v1".into(), friend_id: "v2".into() }).await;

    assert_eq!(
        recv_named(&mut ann_rx, "friend:added").await,
        ServerEvent::FriendAdded { user_id: "v1".into(), friend_id: "v2".into() }
    );
    assert_eq!(
        recv_named(&mut bob_rx, "friend:added").await,
        ServerEvent::FriendAdded { user_id: "v2".into(), friend_id: "v1".into() }
    );
}

#[tokio::test]
async fn friend_removed_for_disconnected_friend_is_silent() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch(&state, &ann, ClientEvent::FriendRemoved { user_id: "v1".into(), friend_id: "gone".into() }).await;

    assert_eq!(
        recv_named(&mut ann_rx, "friend:removed").await,
        ServerEvent::FriendRemoved { user_id: "v1".into(), friend_id: "gone".into() }
    );
    assert_no_event_named(&mut ann_rx, "chat:error").await;
}

// =============================================================================
// dispatch_text
// =============================================================================

#[tokio::test]
async fn malformed_frames_are_dropped_without_side_effects() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch_text(&state, &ann, "not json").await;
    dispatch_text(&state, &ann, r#"{"event":"chat:explode","data":{}}"#).await;
    dispatch_text(&state, &ann, r#"{"event":"chat:send","data":{}}"#).await;
    dispatch_text(&state, &ann, r#"{"event":"canvas:stroke","data":{"strokeData":{}}}"#).await;

    assert!(drain(&mut ann_rx).await.is_empty());
    assert!(state.canvas.list_strokes().is_empty());
}

#[tokio::test]
async fn text_frames_decode_and_dispatch() {
    let state = test_helpers::test_app_state();
    let (ann, mut ann_rx) = join_session(&state, "v1", "Ann").await;

    dispatch_text(&state, &ann, r#"{"event":"chat:send","data":{"text":"hi"}}"#).await;
    let ServerEvent::ChatMessage(message) = recv_named(&mut ann_rx, "chat:message").await else {
        unreachable!();
    };
    assert_eq!(message.text, "hi");

    dispatch_text(&state, &ann, r#"{"event":"chat:typing"}"#).await;
    assert_eq!(recv_named(&mut ann_rx, "chat:typing").await, ServerEvent::ChatTyping(vec!["Ann".into()]));
}
