// Library interface for socket_relay
// Bridges one upstream TCP text service to the most recent browser WebSocket session

pub mod config;
pub mod controller;
pub mod demo_upstream;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod upstream;

pub use config::RelayConfig;
pub use controller::{RelayController, RelayTasks};
pub use error::RelayError;
pub use registry::SessionRegistry;
pub use transport::{BrowserTransport, SessionHandle, SessionId, TransportEvent};
pub use upstream::{LinkState, UpstreamLink};

use anyhow::{Context, Result};
use axum::{
    Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct RelayState {
    pub upstream: Arc<UpstreamLink>,
    pub registry: Arc<SessionRegistry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub upstream: LinkState,
    pub current_session: Option<SessionId>,
    pub session_connected_at: Option<DateTime<Utc>>,
}

/// Health and status routes merged with the transport's WebSocket and file routes.
pub fn create_app(transport: &BrowserTransport, state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .with_state(state)
        .merge(transport.router())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn get_status(State(state): State<RelayState>) -> impl IntoResponse {
    let current = state.registry.current();
    Json(StatusResponse {
        upstream: state.upstream.state(),
        current_session: current.as_ref().map(SessionHandle::id),
        session_connected_at: current.as_ref().map(SessionHandle::connected_at),
    })
}

/// A running relay: upstream link, session registry, forwarding tasks and the
/// bound browser listener.
pub struct Relay {
    upstream: Arc<UpstreamLink>,
    registry: Arc<SessionRegistry>,
    listener: TcpListener,
    local_addr: SocketAddr,
    app: Router,
    tasks: RelayTasks,
}

impl Relay {
    /// Bind the browser listener, connect upstream once and start forwarding.
    ///
    /// An upstream connect failure is logged, not returned: browser sessions
    /// are still accepted, but nothing reaches or comes from the upstream.
    pub async fn start(config: &RelayConfig) -> Result<Self> {
        let addr = config.browser.addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind browser listener on {}", addr))?;
        let local_addr = listener.local_addr()?;

        let upstream = Arc::new(UpstreamLink::new(
            &config.upstream.host,
            config.upstream.port,
        ));
        let chunks = upstream
            .take_messages()
            .context("upstream message stream already taken")?;
        if let Err(e) = upstream.connect().await {
            error!("{}; relay will run without an upstream", e);
        }

        let registry = Arc::new(SessionRegistry::new());
        let (transport, events) =
            BrowserTransport::new(config.browser.ws_path.clone(), config.browser.static_root());

        let controller = RelayController::new(upstream.clone(), registry.clone());
        let tasks = controller.start(chunks, events);

        let app = create_app(
            &transport,
            RelayState {
                upstream: upstream.clone(),
                registry: registry.clone(),
            },
        );

        Ok(Self {
            upstream,
            registry,
            listener,
            local_addr,
            app,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn upstream(&self) -> Arc<UpstreamLink> {
        self.upstream.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Serve browser traffic until the listener fails.
    pub async fn serve(self) -> Result<()> {
        info!("Relay listening on http://{}", self.local_addr);
        let result = axum::serve(self.listener, self.app).await;
        self.tasks.abort();
        result.context("browser listener failed")
    }
}
