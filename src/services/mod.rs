//! Core relay services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Each shared structure is owned by one service behind its own lock:
//! sessions by `session`, online and typing state by `presence`, the stroke
//! log by `canvas`, the profanity cache by `moderation`. `router` decides the
//! fan-out for every inbound event, and `persistence` carries fire-and-forget
//! writes to the store.

pub mod canvas;
pub mod moderation;
pub mod persistence;
pub mod presence;
pub mod router;
pub mod session;
