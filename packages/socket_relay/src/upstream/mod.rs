//! Outbound TCP link to the upstream text service.
//!
//! Writes are line-framed: every `send` appends exactly one `\n`. Reads are
//! not framed at all. Each socket read is UTF-8 decoded and handed on as one
//! chunk, which may hold part of a line or several lines.

mod actor;
pub mod decoder;

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::RelayError;
use actor::{UpstreamActor, UpstreamMessage};

const CHUNK_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

pub struct UpstreamLink {
    addr: String,
    sender: mpsc::Sender<UpstreamMessage>,
    state: watch::Receiver<LinkState>,
    messages: Mutex<Option<mpsc::Receiver<String>>>,
}

impl UpstreamLink {
    /// Create a link in the `Disconnected` state. Must be called inside a tokio
    /// runtime.
    pub fn new(host: &str, port: u16) -> Self {
        let addr = format!("{}:{}", host, port);
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(LinkState::Disconnected);
        let sender = UpstreamActor::spawn(addr.clone(), chunk_tx, state_tx);

        Self {
            addr,
            sender,
            state,
            messages: Mutex::new(Some(chunk_rx)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connect once. A failure is permanent for the life of the link.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let (respond_to, response) = oneshot::channel();
        let gone = || RelayError::Connect {
            addr: self.addr.clone(),
            source: std::io::Error::other("upstream actor stopped"),
        };

        self.sender
            .send(UpstreamMessage::Connect { respond_to })
            .await
            .map_err(|_| gone())?;

        response.await.map_err(|_| gone())?
    }

    /// Write `text` followed by a single newline. Returns the bytes written.
    pub async fn send(&self, text: &str) -> Result<usize, RelayError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(UpstreamMessage::Send {
                text: text.to_string(),
                respond_to,
            })
            .await
            .map_err(|_| RelayError::Write("upstream actor stopped".into()))?;

        response
            .await
            .map_err(|_| RelayError::Write("upstream actor dropped the request".into()))?
    }

    /// Current link state. Answers immediately, even while a connect or a
    /// write is in progress.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Take the stream of inbound chunks, in arrival order. Available once;
    /// the stream ends when the connection closes or fails to open.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<String>> {
        self.messages.lock().ok()?.take()
    }
}
