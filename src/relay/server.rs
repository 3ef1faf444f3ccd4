//! Relay Server
//!
//! Two listeners: the websocket relay every client keeps open, and a small
//! HTTP listener answering discovery probes and status queries.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handler;
use super::registry::{ChannelRegistry, Outbound, Outlet};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::{SERVICE_NAME, VERSION};

/// How long stop() waits for a listener to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Leader as last reported by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderInfo {
    pub leader: Option<Ipv4Addr>,
    pub is_self: bool,
}

/// Discovery document served on `/api/ping` and `/api/discovery`
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDocument {
    pub service: &'static str,
    pub version: &'static str,
    pub status: &'static str,
    pub mode: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    timestamp: String,
}

/// Addresses the listeners actually bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAddrs {
    pub ws: SocketAddr,
    pub http: SocketAddr,
}

/// Shared state behind both routers
pub struct RelayState {
    pub registry: Arc<ChannelRegistry>,
    pub mode: String,
    pub started_at: Instant,
    pub leader: RwLock<LeaderInfo>,
    shutdown: CancellationToken,
}

/// Relay server
pub struct RelayServer {
    config: RelayConfig,
    state: Arc<RelayState>,
    bound: Mutex<Option<RelayAddrs>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let state = Arc::new(RelayState {
            registry: Arc::new(ChannelRegistry::new(config.channels.clone())),
            mode: config.mode.clone(),
            started_at: Instant::now(),
            leader: RwLock::new(LeaderInfo::default()),
            shutdown: CancellationToken::new(),
        });

        Self {
            config,
            state,
            bound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// Record the current leader for `/api/leader`
    pub async fn set_leader(&self, leader: Option<Ipv4Addr>, is_self: bool) {
        *self.state.leader.write().await = LeaderInfo { leader, is_self };
    }

    pub async fn leader(&self) -> LeaderInfo {
        self.state.leader.read().await.clone()
    }

    /// Router for the websocket relay listener
    pub fn ws_router(&self) -> Router {
        Router::new()
            .route("/", get(handle_upgrade))
            .route("/socket.io/", get(handle_upgrade))
            .with_state(Arc::clone(&self.state))
    }

    /// Router for the HTTP discovery listener
    pub fn http_router(&self) -> Router {
        Router::new()
            .route("/api/ping", get(handle_discovery))
            .route("/api/discovery", get(handle_discovery))
            .route("/api/dewicom-discovery", get(handle_discovery))
            .route("/api/health", get(handle_health))
            .route("/api/channels", get(handle_channels))
            .route("/api/leader", get(handle_leader))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(Arc::clone(&self.state))
    }

    /// Bind both listeners and start serving. Calling it again returns the
    /// addresses already bound.
    pub async fn start(&self) -> Result<RelayAddrs> {
        if self.state.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let mut bound = self.bound.lock().await;
        if let Some(addrs) = *bound {
            return Ok(addrs);
        }

        let ws_listener = TcpListener::bind(&self.config.ws_bind_address)
            .await
            .map_err(|e| Error::bind(&self.config.ws_bind_address, e))?;
        let http_listener = TcpListener::bind(&self.config.http_bind_address)
            .await
            .map_err(|e| Error::bind(&self.config.http_bind_address, e))?;

        let addrs = RelayAddrs {
            ws: ws_listener.local_addr()?,
            http: http_listener.local_addr()?,
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.serve(ws_listener, self.ws_router(), "relay"));
        tasks.push(self.serve(http_listener, self.http_router(), "discovery"));

        tracing::info!("Relay listening on ws://{} (discovery on http://{})", addrs.ws, addrs.http);

        *bound = Some(addrs);
        Ok(addrs)
    }

    fn serve(&self, listener: TcpListener, router: Router, name: &'static str) -> JoinHandle<()> {
        let token = self.state.shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("{} listener failed: {}", name, e);
            }
        })
    }

    /// Close every session and both listeners. Safe to call more than once.
    pub async fn stop(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        self.state.shutdown.cancel();
        self.state.registry.close_all().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        tracing::info!("Relay stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }
}

async fn handle_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

/// Serve one relay connection until it closes
async fn serve_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sink, mut stream) = socket.split();
    let (outlet, mut rx) = Outlet::channel();
    let closed = outlet.closed();
    let registry = Arc::clone(&state.registry);
    let id = registry.connect(outlet.clone()).await;

    // Writer: drains the outbound queue until closed or every sender is gone
    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                biased;
                _ = writer_closed.cancelled() => Outbound::Close,
                next = rx.recv() => match next {
                    Some(outbound) => outbound,
                    None => break,
                },
            };
            let message = match outbound {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Binary(frame) => Message::Binary(frame.to_vec()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = closed.cancelled() => {
                tracing::debug!("Connection {} closed by the relay", id);
                break;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = handler::handle_text(&registry, id, &text).await {
                    outlet.push(Outbound::Text(reply));
                }
            }
            Some(Ok(Message::Binary(data))) => {
                handler::handle_binary(&registry, id, Bytes::from(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Protocol-level ping/pong is answered by the socket itself
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!("Connection {} read error: {}", id, e);
                break;
            }
        }
    }

    registry.leave(id).await;
    drop(outlet);
    let abort = writer.abort_handle();
    if tokio::time::timeout(SHUTDOWN_GRACE, writer).await.is_err() {
        tracing::debug!("Writer for {} did not finish in time", id);
        abort.abort();
    }
}

async fn handle_discovery(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(DiscoveryDocument {
        service: SERVICE_NAME,
        version: VERSION,
        status: "running",
        mode: state.mode.clone(),
    })
}

async fn handle_health(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn handle_channels(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(state.registry.roster_with_members().await)
}

async fn handle_leader(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(state.leader.read().await.clone())
}
