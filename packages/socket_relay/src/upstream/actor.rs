use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::LinkState;
use super::decoder::Utf8ChunkDecoder;
use crate::error::RelayError;

const READ_BUFFER_SIZE: usize = 4096;

/// Messages that can be sent to the upstream actor
pub enum UpstreamMessage {
    Connect {
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
    Send {
        text: String,
        respond_to: oneshot::Sender<Result<usize, RelayError>>,
    },
    /// Posted by the read loop when the socket reaches EOF or errors out.
    ReaderClosed { state: LinkState },
}

/// Owns the TCP socket's write half and publishes the link state.
pub struct UpstreamActor {
    addr: String,
    state: watch::Sender<LinkState>,
    writer: Option<OwnedWriteHalf>,
    chunk_tx: Option<mpsc::Sender<String>>,
    notify: mpsc::WeakSender<UpstreamMessage>,
    receiver: mpsc::Receiver<UpstreamMessage>,
}

impl UpstreamActor {
    /// Start the actor task. Decoded inbound chunks are delivered on `chunk_tx`
    /// once the link connects. State changes are published on `state` as they
    /// happen, so readers never wait on the actor.
    pub fn spawn(
        addr: String,
        chunk_tx: mpsc::Sender<String>,
        state: watch::Sender<LinkState>,
    ) -> mpsc::Sender<UpstreamMessage> {
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let mut actor = Self {
            addr,
            state,
            writer: None,
            chunk_tx: Some(chunk_tx),
            notify: msg_tx.downgrade(),
            receiver: msg_rx,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        msg_tx
    }

    async fn run(&mut self) {
        debug!("Upstream actor started for {}", self.addr);

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                UpstreamMessage::Connect { respond_to } => {
                    let result = self.handle_connect().await;
                    let _ = respond_to.send(result);
                }
                UpstreamMessage::Send { text, respond_to } => {
                    let result = self.handle_send(text).await;
                    let _ = respond_to.send(result);
                }
                UpstreamMessage::ReaderClosed { state } => {
                    info!("Upstream link to {} is now {:?}", self.addr, state);
                    self.set_state(state);
                    self.writer = None;
                }
            }
        }

        debug!("Upstream actor shutting down");
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    fn current_state(&self) -> LinkState {
        *self.state.borrow()
    }

    async fn handle_connect(&mut self) -> Result<(), RelayError> {
        // The chunk sender is handed to the reader on the first attempt, so its
        // absence means connect already ran. There is no second attempt.
        let Some(chunk_tx) = self.chunk_tx.take() else {
            return Err(RelayError::Connect {
                addr: self.addr.clone(),
                source: std::io::Error::other("connect was already attempted"),
            });
        };

        self.set_state(LinkState::Connecting);
        info!("Connecting to upstream {}", self.addr);

        let stream = match TcpStream::connect(self.addr.as_str()).await {
            Ok(stream) => stream,
            Err(source) => {
                error!("Failed to connect to upstream {}: {}", self.addr, source);
                self.set_state(LinkState::Failed);
                return Err(RelayError::Connect {
                    addr: self.addr.clone(),
                    source,
                });
            }
        };

        let (reader, writer) = stream.into_split();
        self.writer = Some(writer);
        self.set_state(LinkState::Connected);
        info!("Connected to upstream {}", self.addr);

        tokio::spawn(read_loop(reader, chunk_tx, self.notify.clone()));
        Ok(())
    }

    async fn handle_send(&mut self, mut text: String) -> Result<usize, RelayError> {
        let state = self.current_state();
        if state != LinkState::Connected {
            return Err(RelayError::Write(format!("upstream link is {:?}", state)));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RelayError::Write("no upstream writer available".into()))?;

        text.push('\n');
        let written = match writer.write_all(text.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!("Upstream write to {} failed: {}", self.addr, e);
            self.set_state(LinkState::Failed);
            self.writer = None;
            return Err(RelayError::Write(e.to_string()));
        }
        Ok(text.len())
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    chunk_tx: mpsc::Sender<String>,
    notify: mpsc::WeakSender<UpstreamMessage>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8ChunkDecoder::new();

    let end_state = loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                info!("Upstream closed the connection");
                break LinkState::Disconnected;
            }
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if text.is_empty() {
                    continue;
                }
                // Nobody listening is not an error; keep draining the socket.
                let _ = chunk_tx.send(text).await;
            }
            Err(e) => {
                warn!("Error reading from upstream: {}", e);
                break LinkState::Failed;
            }
        }
    };

    if let Some(tail) = decoder.finish() {
        let _ = chunk_tx.send(tail).await;
    }
    if let Some(tx) = notify.upgrade() {
        let _ = tx
            .send(UpstreamMessage::ReaderClosed { state: end_state })
            .await;
    }
    debug!("Upstream reader exiting");
}
