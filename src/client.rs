//! Relay client — connects to `/api/ws` with a bounded handshake.
//!
//! DESIGN
//! ======
//! A handshake that does not finish within the timeout, or that fails at the
//! transport, puts the client into offline mode for good. Later `connect`
//! calls fail fast with `ConnectError::Offline` and never touch the network;
//! the caller must build a new client to try again. There is no automatic
//! reconnect, so a flapping server cannot trigger a retry storm.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::event::{ClientEvent, ServerEvent};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),
    #[error("websocket transport failed: {0}")]
    Transport(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("client is offline after an earlier connect failure")]
    Offline,
    #[error("connection closed")]
    Closed,
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
    #[error("query encoding failed: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),
    #[error("event codec failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Factory for relay connections. Clones share the offline flag.
#[derive(Debug, Clone)]
pub struct RelayClient {
    base_url: String,
    timeout: Duration,
    failed: Arc<AtomicBool>,
}

impl RelayClient {
    /// `base_url` is `http(s)://host[:port]` or `ws(s)://host[:port]`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_CONNECT_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self { base_url: base_url.into(), timeout, failed: Arc::default() }
    }

    /// True once a handshake has failed.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Open a relay session as `visitor_id`.
    ///
    /// # Errors
    ///
    /// Returns `Offline` if an earlier attempt failed, `Timeout` or
    /// `Transport` if this handshake fails (which also switches the client
    /// offline), or `InvalidBaseUrl` for an unsupported scheme.
    pub async fn connect(&self, visitor_id: &str, username: &str) -> Result<RelayConnection, ConnectError> {
        if self.is_offline() {
            return Err(ConnectError::Offline);
        }

        let url = ws_url(&self.base_url, visitor_id, username)?;
        match tokio::time::timeout(self.timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => {
                debug!(%url, "relay client connected");
                Ok(RelayConnection { stream })
            }
            Ok(Err(e)) => {
                self.failed.store(true, Ordering::Release);
                warn!(error = %e, %url, "relay handshake failed; client offline");
                Err(ConnectError::Transport(Box::new(e)))
            }
            Err(_) => {
                self.failed.store(true, Ordering::Release);
                warn!(timeout_ms = self.timeout.as_millis(), %url, "relay handshake timed out; client offline");
                Err(ConnectError::Timeout(self.timeout))
            }
        }
    }
}

/// One open relay session.
pub struct RelayConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayConnection {
    /// # Errors
    ///
    /// Returns an encoding or transport error.
    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), ConnectError> {
        let json = event.encode()?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectError::Transport(Box::new(e)))
    }

    /// Wait for the next server event, skipping control frames.
    ///
    /// # Errors
    ///
    /// Returns `Closed` when the server closes the socket, or a transport
    /// or decode error.
    pub async fn next_event(&mut self) -> Result<ServerEvent, ConnectError> {
        loop {
            let Some(msg) = self.stream.next().await else {
                return Err(ConnectError::Closed);
            };
            match msg.map_err(|e| ConnectError::Transport(Box::new(e)))? {
                Message::Text(text) => return Ok(ServerEvent::parse(text.as_str())?),
                Message::Close(_) => return Err(ConnectError::Closed),
                _ => {}
            }
        }
    }

    /// # Errors
    ///
    /// Returns a transport error if the close handshake fails.
    pub async fn close(mut self) -> Result<(), ConnectError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ConnectError::Transport(Box::new(e)))
    }
}

fn ws_url(base_url: &str, visitor_id: &str, username: &str) -> Result<String, ConnectError> {
    let trimmed = base_url.trim_end_matches('/');
    let pairs = [("visitorId", visitor_id), ("username", username)];
    let query = serde_urlencoded::to_string(pairs.as_slice())?;

    for (from, to) in [("http://", "ws://"), ("https://", "wss://"), ("ws://", "ws://"), ("wss://", "wss://")] {
        if let Some(rest) = trimmed.strip_prefix(from) {
            return Ok(format!("{to}{rest}/api/ws?{query}"));
        }
    }

    Err(ConnectError::InvalidBaseUrl(base_url.to_owned()))
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
