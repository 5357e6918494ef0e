//! Browser-facing WebSocket transport.
//!
//! Each upgraded socket becomes a session. Text frames carry a JSON
//! [`EventFrame`]; everything a session receives is reported on one ordered
//! event channel, and everything sent to it goes through its [`SessionHandle`].

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::protocol::EventFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cheap, cloneable handle for sending to one browser session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<EventFrame>,
    connected_at: DateTime<Utc>,
}

impl SessionHandle {
    /// A new session and the receiving end of its outbound queue. The session
    /// counts as closed once the receiver is dropped.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<EventFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: SessionId::new(),
            tx,
            connected_at: Utc::now(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue an event for this session. Never blocks; fails only if the
    /// session's socket has gone away.
    pub fn send(&self, event: &str, payload: impl Into<String>) -> Result<(), RelayError> {
        self.tx
            .send(EventFrame::new(event, payload))
            .map_err(|_| RelayError::SessionSend(self.id))
    }
}

/// Everything the transport observes, in per-session order.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(SessionHandle),
    Message {
        session: SessionId,
        event: String,
        data: String,
    },
    Disconnected(SessionId),
}

#[derive(Clone)]
pub struct BrowserTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    ws_path: String,
    static_dir: Option<PathBuf>,
}

impl BrowserTransport {
    pub fn new(
        ws_path: impl Into<String>,
        static_dir: Option<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            events,
            ws_path: ws_path.into(),
            static_dir,
        };
        (transport, events_rx)
    }

    /// WebSocket route plus, when configured, static files as the fallback.
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route(&self.ws_path, get(websocket_handler))
            .with_state(self.clone());

        match &self.static_dir {
            Some(dir) => router.fallback_service(ServeDir::new(dir)),
            None => router,
        }
    }
}

async fn websocket_handler(
    State(transport): State<BrowserTransport>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, transport.events))
}

pub async fn handle_websocket(socket: WebSocket, events: mpsc::UnboundedSender<TransportEvent>) {
    let (mut sender, mut receiver) = socket.split();

    let (session, mut outbound) = SessionHandle::open();
    let id = session.id();
    info!("Browser session {} connected", id);

    if events.send(TransportEvent::Connected(session)).is_err() {
        warn!("Relay is not running, dropping session {}", id);
        return;
    }

    loop {
        tokio::select! {
            Some(frame) = outbound.recv() => {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode frame for session {}: {}", id, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<EventFrame>(&text) {
                        Ok(frame) => {
                            let _ = events.send(TransportEvent::Message {
                                session: id,
                                event: frame.event,
                                data: frame.data,
                            });
                        }
                        Err(e) => debug!("Ignoring malformed frame from session {}: {}", id, e),
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Binary messages not supported");
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Browser session {} closed", id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error on session {}: {}", id, e);
                    break;
                }
            },
        }
    }

    // Dropping the queue marks every clone of the handle as closed.
    drop(outbound);
    let _ = events.send(TransportEvent::Disconnected(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MESSAGE_EVENT;

    #[test]
    fn send_queues_an_event_frame() {
        let (session, mut rx) = SessionHandle::open();
        session.send(MESSAGE_EVENT, "chunk").unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, EventFrame::new("message", "chunk"));
    }

    #[test]
    fn send_to_closed_session_is_a_session_error() {
        let (session, rx) = SessionHandle::open();
        assert!(!session.is_closed());
        drop(rx);
        assert!(session.is_closed());
        match session.send(MESSAGE_EVENT, "late") {
            Err(RelayError::SessionSend(id)) => assert_eq!(id, session.id()),
            other => panic!("expected SessionSend, got {:?}", other),
        }
    }

    #[test]
    fn session_ids_are_unique() {
        let (a, _ra) = SessionHandle::open();
        let (b, _rb) = SessionHandle::open();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn session_id_serializes_as_plain_uuid() {
        let id = SessionId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json.as_str().unwrap(), id.to_string());
    }
}
