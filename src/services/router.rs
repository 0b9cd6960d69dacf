//! Broadcast router — inbound event handling and fan-out.
//!
//! DESIGN
//! ======
//! Handler functions are business logic only: they validate, mutate shared
//! state, enqueue durable writes, and return an `Outcome`. `apply` owns all
//! outbound delivery, so the fan-out policy for each event kind is visible
//! in one match:
//!
//! - all sessions, sender included: chat send, reaction, typing, canvas clear
//! - all but the sender: canvas stroke, cursor, cursor removal
//! - targeted by visitor: friend request, friend added, friend removed
//!
//! ERROR HANDLING
//! ==============
//! Malformed payloads are logged at warn and dropped. Only moderation
//! rejections reach the user, as a `chat:error` to the sender alone.
//! Persistence failures never block or cancel a broadcast.

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{ClientEvent, ServerEvent};
use crate::services::persistence::{self, PersistJob};
use crate::services::presence;
use crate::services::session::{Fanout, SessionContext};
use crate::state::{AppState, ChatMessage, Reactions, Stroke, now_ms};

pub const DEFAULT_COLOR: &str = "#000000";
pub const DEFAULT_AVATAR: &str = "👤";
pub const BANNED_MESSAGE: &str = "You are banned from chatting";
pub const SEND_FAILED_MESSAGE: &str = "Failed to send message";

// =============================================================================
// OUTCOME
// =============================================================================

/// What a handler decided. Handlers never deliver events themselves.
#[derive(Debug)]
enum Outcome {
    /// Deliver each event, in order, to every session including the sender.
    Broadcast(Vec<ServerEvent>),
    /// Deliver to every session except the sender.
    BroadcastExcludeSender(ServerEvent),
    /// Deliver to the sender only.
    Reply(ServerEvent),
    /// Deliver each event to every session of its visitor, then optionally
    /// reply to the sender.
    Targeted { deliveries: Vec<(String, ServerEvent)>, reply: Option<ServerEvent> },
    /// Nothing to deliver.
    Dropped,
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Decode one inbound text frame and dispatch it.
pub async fn dispatch_text(state: &AppState, ctx: &SessionContext, text: &str) {
    match ClientEvent::parse(text) {
        Ok(event) => dispatch(state, ctx, event).await,
        Err(e) => warn!(session_id = %ctx.session_id, error = %e, "malformed event; dropping"),
    }
}

/// Handle one inbound event and fan out the result.
pub async fn dispatch(state: &AppState, ctx: &SessionContext, event: ClientEvent) {
    let name = event.name();
    if !matches!(event, ClientEvent::CanvasCursor { .. } | ClientEvent::CanvasCursorRemove { .. }) {
        info!(session_id = %ctx.session_id, visitor_id = %ctx.visitor_id, event = name, "recv event");
    }

    let outcome = handle(state, ctx, event).await;
    if matches!(outcome, Outcome::Dropped) {
        debug!(session_id = %ctx.session_id, event = name, "event produced no delivery");
    }
    apply(state, ctx, outcome).await;
}

async fn handle(state: &AppState, ctx: &SessionContext, event: ClientEvent) -> Outcome {
    match event {
        ClientEvent::ChatSend { text, color, avatar, avatar_image } => {
            handle_chat_send(state, ctx, text, color, avatar, avatar_image).await
        }
        ClientEvent::ChatTyping {} => {
            presence::record_typing(state, &ctx.visitor_id, &ctx.username);
            Outcome::Broadcast(vec![presence::typing_event(state)])
        }
        ClientEvent::ChatStopTyping {} => {
            presence::drop_typing(state, &ctx.visitor_id);
            Outcome::Broadcast(vec![presence::typing_event(state)])
        }
        ClientEvent::ChatReaction { message_id, emoji } => handle_reaction(state, ctx, message_id, emoji).await,
        ClientEvent::CanvasStroke { id, stroke_data } => handle_stroke(state, ctx, id, stroke_data),
        ClientEvent::CanvasClear {} => {
            let marker = state.canvas.clear(&ctx.visitor_id, now_ms());
            persistence::enqueue(state, PersistJob::CanvasCleared(marker.clone()));
            info!(visitor_id = %ctx.visitor_id, generation = marker.generation, "canvas cleared");
            Outcome::Broadcast(vec![ServerEvent::CanvasClear(marker)])
        }
        ClientEvent::CanvasCursor { user_id, cursor_data } => {
            if user_id.is_empty() || cursor_data.is_null() {
                return malformed(ctx, "canvas:cursor", "userId and cursorData required");
            }
            state.canvas.track_cursor(ctx.session_id, &user_id);
            Outcome::BroadcastExcludeSender(ServerEvent::CanvasCursor { user_id, cursor_data })
        }
        ClientEvent::CanvasCursorRemove { user_id } => {
            if user_id.is_empty() {
                return malformed(ctx, "canvas:cursor:remove", "userId required");
            }
            state.canvas.forget_cursor(ctx.session_id, &user_id);
            Outcome::BroadcastExcludeSender(ServerEvent::CanvasCursorRemove { user_id })
        }
        ClientEvent::FriendRequest { from_user_id, to_user_id } => {
            if from_user_id.is_empty() || to_user_id.is_empty() {
                return malformed(ctx, "friend:request", "fromUserId and toUserId required");
            }
            Outcome::Targeted {
                deliveries: vec![(
                    to_user_id.clone(),
                    ServerEvent::FriendRequestReceived { from_user_id: from_user_id.clone(), to_user_id: to_user_id.clone() },
                )],
                reply: Some(ServerEvent::FriendRequestSent { from_user_id, to_user_id }),
            }
        }
        ClientEvent::FriendAdded { user_id, friend_id } => {
            if user_id.is_empty() || friend_id.is_empty() {
                return malformed(ctx, "friend:added", "userId and friendId required");
            }
            let mirrored = ServerEvent::FriendAdded { user_id: friend_id.clone(), friend_id: user_id.clone() };
            Outcome::Targeted {
                deliveries: vec![
                    (user_id.clone(), ServerEvent::FriendAdded { user_id, friend_id: friend_id.clone() }),
                    (friend_id, mirrored),
                ],
                reply: None,
            }
        }
        ClientEvent::FriendRemoved { user_id, friend_id } => {
            if user_id.is_empty() || friend_id.is_empty() {
                return malformed(ctx, "friend:removed", "userId and friendId required");
            }
            let mirrored = ServerEvent::FriendRemoved { user_id: friend_id.clone(), friend_id: user_id.clone() };
            Outcome::Targeted {
                deliveries: vec![
                    (user_id.clone(), ServerEvent::FriendRemoved { user_id, friend_id: friend_id.clone() }),
                    (friend_id, mirrored),
                ],
                reply: None,
            }
        }
    }
}

async fn apply(state: &AppState, ctx: &SessionContext, outcome: Outcome) {
    match outcome {
        Outcome::Broadcast(events) => {
            for event in &events {
                state.sessions.deliver(event, Fanout::All).await;
            }
        }
        Outcome::BroadcastExcludeSender(event) => {
            state
                .sessions
                .deliver(&event, Fanout::AllExcept(ctx.session_id))
                .await;
        }
        Outcome::Reply(event) => {
            state
                .sessions
                .deliver(&event, Fanout::Session(ctx.session_id))
                .await;
        }
        Outcome::Targeted { deliveries, reply } => {
            for (visitor_id, event) in &deliveries {
                let delivered = state.sessions.deliver(event, Fanout::Visitor(visitor_id)).await;
                if delivered == 0 {
                    debug!(%visitor_id, event = event.name(), "target not connected; dropping");
                }
            }
            if let Some(event) = reply {
                state
                    .sessions
                    .deliver(&event, Fanout::Session(ctx.session_id))
                    .await;
            }
        }
        Outcome::Dropped => {}
    }
}

fn malformed(ctx: &SessionContext, event: &'static str, reason: &'static str) -> Outcome {
    warn!(session_id = %ctx.session_id, event, reason, "malformed event; dropping");
    Outcome::Dropped
}

// =============================================================================
// CHAT
// =============================================================================

async fn handle_chat_send(
    state: &AppState,
    ctx: &SessionContext,
    text: String,
    color: Option<String>,
    avatar: Option<String>,
    avatar_image: Option<String>,
) -> Outcome {
    if text.trim().is_empty() {
        return malformed(ctx, "chat:send", "text required");
    }

    match state.moderation.is_banned(&ctx.visitor_id).await {
        Ok(false) => {}
        Ok(true) => {
            info!(visitor_id = %ctx.visitor_id, "chat send rejected: banned");
            return Outcome::Reply(ServerEvent::ChatError { message: BANNED_MESSAGE.into() });
        }
        Err(e) => {
            warn!(error = %e, visitor_id = %ctx.visitor_id, "ban lookup failed; rejecting chat send");
            return Outcome::Reply(ServerEvent::ChatError { message: SEND_FAILED_MESSAGE.into() });
        }
    }

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        user: ctx.username.clone(),
        text: state.moderation.mask_profanity(&text),
        color: non_empty(color).unwrap_or_else(|| DEFAULT_COLOR.into()),
        time: now_ms(),
        uid: ctx.visitor_id.clone(),
        avatar: non_empty(avatar).unwrap_or_else(|| DEFAULT_AVATAR.into()),
        avatar_image: non_empty(avatar_image),
        reactions: Reactions::new(),
    };
    persistence::enqueue(state, PersistJob::ChatMessage(message.clone()));

    presence::drop_typing(state, &ctx.visitor_id);
    Outcome::Broadcast(vec![ServerEvent::ChatMessage(message), presence::typing_event(state)])
}

async fn handle_reaction(state: &AppState, ctx: &SessionContext, message_id: String, emoji: String) -> Outcome {
    if message_id.is_empty() || emoji.is_empty() {
        return malformed(ctx, "chat:reaction", "messageId and emoji required");
    }

    match persistence::increment_reaction(state, &message_id, &emoji).await {
        Ok(Some(reactions)) => Outcome::Broadcast(vec![ServerEvent::ChatReaction { message_id, reactions }]),
        Ok(None) => {
            debug!(%message_id, "reaction for unknown message; dropping");
            Outcome::Dropped
        }
        Err(e) => {
            warn!(error = %e, %message_id, "reaction increment failed");
            Outcome::Dropped
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// =============================================================================
// CANVAS
// =============================================================================

fn handle_stroke(state: &AppState, ctx: &SessionContext, id: String, stroke_data: Value) -> Outcome {
    if id.is_empty() || stroke_data.is_null() {
        return malformed(ctx, "canvas:stroke", "id and strokeData required");
    }

    let stroke = Stroke { id, stroke_data };
    state.canvas.append_stroke(stroke.clone());
    persistence::enqueue(state, PersistJob::Stroke(stroke.clone()));
    Outcome::BroadcastExcludeSender(ServerEvent::CanvasStroke(stroke))
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
