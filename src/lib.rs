//! Real-time relay for chat, presence and a shared canvas.
//!
//! ARCHITECTURE
//! ============
//! Browsers hold one WebSocket each. `routes::ws` turns a connection into a
//! session, `services::router` decides who hears each inbound event, and
//! `services::persistence` mirrors accepted state to the store without
//! holding up delivery.

pub mod client;
pub mod config;
pub mod db;
pub mod event;
pub mod routes;
pub mod services;
pub mod state;
