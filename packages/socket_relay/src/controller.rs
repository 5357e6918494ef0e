use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{CLIENT_DATA_EVENT, MESSAGE_EVENT};
use crate::registry::SessionRegistry;
use crate::transport::{SessionId, TransportEvent};
use crate::upstream::UpstreamLink;

/// Wires the upstream link to whichever browser session is current.
///
/// Upstream chunks, session bookkeeping and upstream writes each run on their
/// own task. A write stalled on a peer that stopped reading holds up later
/// writes only; new sessions still become current and chunks keep flowing.
/// Forwarding failures are logged and dropped.
#[derive(Clone)]
pub struct RelayController {
    upstream: Arc<UpstreamLink>,
    registry: Arc<SessionRegistry>,
}

pub struct RelayTasks {
    pub upstream_to_browser: JoinHandle<()>,
    pub browser_events: JoinHandle<()>,
    pub upstream_writer: JoinHandle<()>,
}

impl RelayTasks {
    pub fn abort(&self) {
        self.upstream_to_browser.abort();
        self.browser_events.abort();
        self.upstream_writer.abort();
    }
}

/// `clientData` payload waiting for its turn on the upstream socket.
#[derive(Debug, PartialEq)]
struct PendingWrite {
    session: SessionId,
    data: String,
}

impl RelayController {
    pub fn new(upstream: Arc<UpstreamLink>, registry: Arc<SessionRegistry>) -> Self {
        Self { upstream, registry }
    }

    pub fn start(
        &self,
        chunks: mpsc::Receiver<String>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> RelayTasks {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();

        let this = self.clone();
        let upstream_to_browser = tokio::spawn(async move {
            this.forward_upstream(chunks).await;
        });

        let this = self.clone();
        let browser_events = tokio::spawn(async move {
            this.forward_browser(events, writes_tx).await;
        });

        let this = self.clone();
        let upstream_writer = tokio::spawn(async move {
            this.write_upstream(writes_rx).await;
        });

        RelayTasks {
            upstream_to_browser,
            browser_events,
            upstream_writer,
        }
    }

    async fn forward_upstream(&self, mut chunks: mpsc::Receiver<String>) {
        while let Some(chunk) = chunks.recv().await {
            self.deliver_chunk(chunk);
        }
        info!("Upstream stream ended, upstream -> browser forwarding stopped");
    }

    async fn forward_browser(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        writes: mpsc::UnboundedSender<PendingWrite>,
    ) {
        while let Some(event) = events.recv().await {
            if let Some(write) = self.handle_event(event) {
                if writes.send(write).is_err() {
                    warn!("Upstream writer stopped, dropping client data");
                }
            }
        }
        debug!("Transport event stream ended");
    }

    async fn write_upstream(&self, mut writes: mpsc::UnboundedReceiver<PendingWrite>) {
        while let Some(PendingWrite { session, data }) = writes.recv().await {
            debug!("Data session {} -> TCP ({} bytes)", session, data.len());
            if let Err(e) = self.upstream.send(&data).await {
                warn!("Dropping message from session {}: {}", session, e);
            }
        }
        debug!("Upstream writer exiting");
    }

    /// Send one upstream chunk to the current session, if there is one.
    /// Returns whether the chunk was handed to a session.
    pub fn deliver_chunk(&self, chunk: String) -> bool {
        let Some(session) = self.registry.current() else {
            debug!("No browser session, dropping {} byte chunk", chunk.len());
            return false;
        };

        debug!("Data TCP -> session {} ({} bytes)", session.id(), chunk.len());
        match session.send(MESSAGE_EVENT, chunk) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    /// Apply a transport event. Session changes take effect immediately;
    /// `clientData` comes back as a write for the upstream writer task.
    fn handle_event(&self, event: TransportEvent) -> Option<PendingWrite> {
        match event {
            TransportEvent::Connected(session) => {
                info!("Session {} is now current", session.id());
                self.registry.set_current(session);
                None
            }
            TransportEvent::Message {
                session,
                event,
                data,
            } => {
                if event != CLIENT_DATA_EVENT {
                    debug!("Ignoring '{}' event from session {}", event, session);
                    return None;
                }
                Some(PendingWrite { session, data })
            }
            TransportEvent::Disconnected(session) => {
                // The registry keeps pointing at it; later sends just fail.
                info!("Session {} disconnected", session);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventFrame;
    use crate::transport::SessionHandle;
    use crate::upstream::LinkState;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Controller whose upstream is connected to a local peer socket.
    async fn connected_controller() -> (RelayController, Arc<SessionRegistry>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let upstream = Arc::new(UpstreamLink::new("127.0.0.1", port));
        upstream.connect().await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();

        let registry = Arc::new(SessionRegistry::new());
        let controller = RelayController::new(upstream, registry.clone());
        (controller, registry, peer)
    }

    fn offline_controller() -> (RelayController, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let upstream = Arc::new(UpstreamLink::new("127.0.0.1", 1));
        (RelayController::new(upstream, registry.clone()), registry)
    }

    struct Running {
        tasks: RelayTasks,
        chunks: mpsc::Sender<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    fn run(controller: &RelayController) -> Running {
        let (chunks, chunk_rx) = mpsc::channel(8);
        let (events, event_rx) = mpsc::unbounded_channel();
        let tasks = controller.start(chunk_rx, event_rx);
        Running {
            tasks,
            chunks,
            events,
        }
    }

    fn client_data(session: SessionId, data: &str) -> TransportEvent {
        TransportEvent::Message {
            session,
            event: CLIENT_DATA_EVENT.into(),
            data: data.into(),
        }
    }

    async fn read_exact_len(peer: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut got = vec![0u8; len];
        timeout(TEST_TIMEOUT, peer.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        got
    }

    #[tokio::test]
    async fn chunks_reach_current_session_in_order() {
        let (controller, registry) = offline_controller();
        let (session, mut rx) = SessionHandle::open();
        registry.set_current(session);

        let chunks = ["a", "partial li", "ne\nnext\n", "\u{2603}"];
        for chunk in chunks {
            assert!(controller.deliver_chunk(chunk.to_string()));
        }
        for chunk in chunks {
            assert_eq!(rx.try_recv().unwrap(), EventFrame::new(MESSAGE_EVENT, chunk));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chunks_without_session_are_dropped() {
        let (controller, _registry) = offline_controller();
        assert!(!controller.deliver_chunk("nobody home".into()));
    }

    #[tokio::test]
    async fn newest_session_takes_over() {
        let (controller, _registry) = offline_controller();
        let (first, mut first_rx) = SessionHandle::open();
        let (second, mut second_rx) = SessionHandle::open();

        assert!(controller.handle_event(TransportEvent::Connected(first)).is_none());
        controller.deliver_chunk("one".into());
        assert!(controller.handle_event(TransportEvent::Connected(second)).is_none());
        controller.deliver_chunk("two".into());

        assert_eq!(first_rx.try_recv().unwrap().data, "one");
        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().unwrap().data, "two");
    }

    #[tokio::test]
    async fn only_client_data_becomes_an_upstream_write() {
        let (controller, _registry) = offline_controller();
        let session = SessionId::new();

        let ignored = TransportEvent::Message {
            session,
            event: "message".into(),
            data: "echo?".into(),
        };
        assert!(controller.handle_event(ignored).is_none());
        assert!(controller.handle_event(TransportEvent::Disconnected(session)).is_none());
        assert_eq!(
            controller.handle_event(client_data(session, "ok")),
            Some(PendingWrite {
                session,
                data: "ok".into()
            })
        );
    }

    #[tokio::test]
    async fn closed_session_does_not_stop_forwarding() {
        let (controller, registry, mut peer) = connected_controller().await;
        let relay = run(&controller);
        let mut changes = registry.subscribe();

        let (session, rx) = SessionHandle::open();
        let id = session.id();
        relay.events.send(TransportEvent::Connected(session)).unwrap();
        timeout(TEST_TIMEOUT, changes.changed()).await.unwrap().unwrap();
        drop(rx);
        relay.events.send(TransportEvent::Disconnected(id)).unwrap();

        assert!(!controller.deliver_chunk("into the void".into()));
        assert_eq!(registry.current().unwrap().id(), id);

        // The other direction is unaffected.
        relay.events.send(client_data(id, "still here")).unwrap();
        assert_eq!(read_exact_len(&mut peer, 11).await, b"still here\n");
        relay.tasks.abort();
    }

    #[tokio::test]
    async fn client_data_is_written_upstream_in_order() {
        let (controller, _registry, mut peer) = connected_controller().await;
        let relay = run(&controller);
        let session = SessionId::new();

        relay
            .events
            .send(TransportEvent::Message {
                session,
                event: "message".into(),
                data: "not forwarded".into(),
            })
            .unwrap();
        for payload in ["first", "second", "third"] {
            relay.events.send(client_data(session, payload)).unwrap();
        }
        assert_eq!(
            read_exact_len(&mut peer, 19).await,
            b"first\nsecond\nthird\n"
        );
        relay.tasks.abort();
    }

    #[tokio::test]
    async fn upstream_write_failure_is_swallowed() {
        let (controller, registry) = offline_controller();
        let relay = run(&controller);
        let mut changes = registry.subscribe();

        // Not connected: the write fails and is only logged.
        relay.events.send(client_data(SessionId::new(), "lost")).unwrap();
        let (session, mut rx) = SessionHandle::open();
        relay.events.send(TransportEvent::Connected(session)).unwrap();
        timeout(TEST_TIMEOUT, changes.changed()).await.unwrap().unwrap();

        relay.chunks.send("still running".into()).await.unwrap();
        let frame = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame.data, "still running");
        assert!(!relay.tasks.upstream_writer.is_finished());
        relay.tasks.abort();
    }

    #[tokio::test]
    async fn started_tasks_forward_both_directions() {
        let (controller, registry, mut peer) = connected_controller().await;
        let relay = run(&controller);

        let mut changes = registry.subscribe();
        let (session, mut rx) = SessionHandle::open();
        let id = session.id();
        relay.events.send(TransportEvent::Connected(session)).unwrap();
        timeout(TEST_TIMEOUT, changes.changed())
            .await
            .unwrap()
            .unwrap();

        relay.chunks.send("PING\n".into()).await.unwrap();
        let frame = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame, EventFrame::new(MESSAGE_EVENT, "PING\n"));

        relay.events.send(client_data(id, "PONG")).unwrap();
        assert_eq!(read_exact_len(&mut peer, 5).await, b"PONG\n");

        relay.tasks.abort();
    }

    #[tokio::test]
    async fn stalled_upstream_write_does_not_delay_session_switch() {
        // The peer never reads, so a large write blocks on the socket.
        let (controller, registry, _peer) = connected_controller().await;
        let relay = run(&controller);
        let mut changes = registry.subscribe();

        let big = "x".repeat(64 * 1024 * 1024);
        relay.events.send(client_data(SessionId::new(), &big)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (session, mut rx) = SessionHandle::open();
        let id = session.id();
        relay.events.send(TransportEvent::Connected(session)).unwrap();
        timeout(Duration::from_secs(1), changes.changed())
            .await
            .expect("session switch waited on the upstream write")
            .unwrap();
        assert_eq!(registry.current().map(|s| s.id()), Some(id));

        // Chunks reach the new session and the link state stays readable.
        relay.chunks.send("fresh\n".into()).await.unwrap();
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.data, "fresh\n");
        assert_eq!(controller.upstream.state(), LinkState::Connected);
        assert!(!relay.tasks.upstream_writer.is_finished());

        relay.tasks.abort();
    }
}
