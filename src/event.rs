//! Event — the wire protocol between browsers and the relay.
//!
//! ARCHITECTURE
//! ============
//! Every WebSocket text message is one JSON envelope:
//! `{"event": "<name>", "data": <payload>}`. Inbound envelopes decode into the
//! closed `ClientEvent` set and outbound ones are built from `ServerEvent`.
//! The router matches these enums exhaustively, so adding an event kind is a
//! compile error everywhere it is not handled.
//!
//! DESIGN
//! ======
//! - Payload field names are camelCase to match the browser client.
//! - A missing or `null` `data` is read as `{}` so body-less events such as
//!   `chat:typing` decode into their empty struct variants.
//! - Decoding failures are reported to the caller; the router logs and drops.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::{ChatMessage, ClearMarker, PresenceRecord, Reactions, Stroke};

// =============================================================================
// INBOUND
// =============================================================================

/// Events a connected client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "chat:send")]
    ChatSend {
        text: String,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
        #[serde(default)]
        avatar_image: Option<String>,
    },
    #[serde(rename = "chat:typing")]
    ChatTyping {},
    #[serde(rename = "chat:stop-typing")]
    ChatStopTyping {},
    #[serde(rename = "chat:reaction")]
    ChatReaction { message_id: String, emoji: String },
    #[serde(rename = "canvas:stroke")]
    CanvasStroke {
        id: String,
        #[serde(default)]
        stroke_data: Value,
    },
    #[serde(rename = "canvas:clear")]
    CanvasClear {},
    #[serde(rename = "canvas:cursor")]
    CanvasCursor {
        user_id: String,
        #[serde(default)]
        cursor_data: Value,
    },
    #[serde(rename = "canvas:cursor:remove")]
    CanvasCursorRemove { user_id: String },
    #[serde(rename = "friend:request")]
    FriendRequest { from_user_id: String, to_user_id: String },
    #[serde(rename = "friend:added")]
    FriendAdded { user_id: String, friend_id: String },
    #[serde(rename = "friend:removed")]
    FriendRemoved { user_id: String, friend_id: String },
}

impl ClientEvent {
    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns a JSON error for invalid JSON, an unknown event name, or a
    /// payload missing a required field.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let mut envelope: Value = serde_json::from_str(text)?;
        if let Value::Object(map) = &mut envelope {
            if map.get("data").is_none_or(Value::is_null) {
                map.insert("data".into(), Value::Object(Map::new()));
            }
        }
        serde_json::from_value(envelope)
    }

    /// Encode for sending over the wire.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if a payload value cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name, used for log fields.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatSend { .. } => "chat:send",
            Self::ChatTyping {} => "chat:typing",
            Self::ChatStopTyping {} => "chat:stop-typing",
            Self::ChatReaction { .. } => "chat:reaction",
            Self::CanvasStroke { .. } => "canvas:stroke",
            Self::CanvasClear {} => "canvas:clear",
            Self::CanvasCursor { .. } => "canvas:cursor",
            Self::CanvasCursorRemove { .. } => "canvas:cursor:remove",
            Self::FriendRequest { .. } => "friend:request",
            Self::FriendAdded { .. } => "friend:added",
            Self::FriendRemoved { .. } => "friend:removed",
        }
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Events the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Recent chat history, oldest first. Sent once on join.
    #[serde(rename = "chat:initial")]
    ChatInitial(Vec<ChatMessage>),
    #[serde(rename = "chat:message")]
    ChatMessage(ChatMessage),
    #[serde(rename = "chat:reaction")]
    ChatReaction { message_id: String, reactions: Reactions },
    /// Display names of visitors currently typing.
    #[serde(rename = "chat:typing")]
    ChatTyping(Vec<String>),
    #[serde(rename = "chat:error")]
    ChatError { message: String },
    #[serde(rename = "visitors:online")]
    VisitorsOnline(Vec<PresenceRecord>),
    #[serde(rename = "visitors:total")]
    VisitorsTotal { total_visitors: i64 },
    /// Full stroke log, oldest first. Sent once on join.
    #[serde(rename = "canvas:initial")]
    CanvasInitial(Vec<Stroke>),
    #[serde(rename = "canvas:stroke")]
    CanvasStroke(Stroke),
    #[serde(rename = "canvas:clear")]
    CanvasClear(ClearMarker),
    #[serde(rename = "canvas:cursor")]
    CanvasCursor { user_id: String, cursor_data: Value },
    #[serde(rename = "canvas:cursor:remove")]
    CanvasCursorRemove { user_id: String },
    #[serde(rename = "friend:added")]
    FriendAdded { user_id: String, friend_id: String },
    #[serde(rename = "friend:removed")]
    FriendRemoved { user_id: String, friend_id: String },
    #[serde(rename = "friend:request:received")]
    FriendRequestReceived { from_user_id: String, to_user_id: String },
    #[serde(rename = "friend:request:sent")]
    FriendRequestSent { from_user_id: String, to_user_id: String },
}

impl ServerEvent {
    /// Encode for sending over the wire.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if a payload value cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one outbound frame. Used by the relay client.
    ///
    /// # Errors
    ///
    /// Returns a JSON error for invalid JSON or an unknown event name.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatInitial(_) => "chat:initial",
            Self::ChatMessage(_) => "chat:message",
            Self::ChatReaction { .. } => "chat:reaction",
            Self::ChatTyping(_) => "chat:typing",
            Self::ChatError { .. } => "chat:error",
            Self::VisitorsOnline(_) => "visitors:online",
            Self::VisitorsTotal { .. } => "visitors:total",
            Self::CanvasInitial(_) => "canvas:initial",
            Self::CanvasStroke(_) => "canvas:stroke",
            Self::CanvasClear(_) => "canvas:clear",
            Self::CanvasCursor { .. } => "canvas:cursor",
            Self::CanvasCursorRemove { .. } => "canvas:cursor:remove",
            Self::FriendAdded { .. } => "friend:added",
            Self::FriendRemoved { .. } => "friend:removed",
            Self::FriendRequestReceived { .. } => "friend:request:received",
            Self::FriendRequestSent { .. } => "friend:request:sent",
        }
    }

    /// Cursor traffic is high-volume and skipped by per-frame logging.
    #[must_use]
    pub fn is_cursor(&self) -> bool {
        matches!(self, Self::CanvasCursor { .. } | Self::CanvasCursorRemove { .. })
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
