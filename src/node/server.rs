//! Backend node HTTP surface.
//!
//! # Responsibilities
//! - Accept upgrades at `/ws` and hand them to the session plane
//! - Serve the node's health and inspection endpoints
//! - Dispatch commands to locally owned clients, forwarding one hop to
//!   the owning node otherwise
//!
//! # Design Decisions
//! - The local table maps client id to the sender feeding its socket, so
//!   HTTP handlers never touch a sink directly
//! - Forwarded commands cannot loop: the owning node resolves locally

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigError, NodeConfig};
use crate::lifecycle::shutdown;
use crate::node::registry::ClientRegistry;
use crate::node::session::{self, LocalClient, LocalClientInfo};
use crate::protocol::{self, ControlMessage};

/// Shared state of one backend node.
pub struct NodeState {
    pub config: NodeConfig,
    pub port: u16,
    /// Milliseconds since the Unix epoch, recorded at construction.
    pub start_time: i64,
    pub registry: Arc<ClientRegistry>,
    pub clients: RwLock<HashMap<String, LocalClient>>,
    forwarder: reqwest::Client,
    leg_counter: AtomicU64,
}

impl NodeState {
    /// Next leg generation for a freshly accepted socket.
    pub fn next_leg(&self) -> u64 {
        self.leg_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn local_count(&self) -> usize {
        let clients = self.clients.read().expect("local client table poisoned");
        clients.len()
    }

    /// Refresh a local client's last-seen time.
    pub fn touch_local(&self, client_id: &str) {
        let mut clients = self.clients.write().expect("local client table poisoned");
        if let Some(entry) = clients.get_mut(client_id) {
            entry.info.last_seen = entry.info.last_seen.max(protocol::timestamp_ms());
        }
    }

    pub fn local_infos(&self) -> Vec<LocalClientInfo> {
        let clients = self.clients.read().expect("local client table poisoned");
        let mut infos: Vec<LocalClientInfo> =
            clients.values().map(|entry| entry.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn local_info(&self, client_id: &str) -> Option<LocalClientInfo> {
        let clients = self.clients.read().expect("local client table poisoned");
        clients.get(client_id).map(|entry| entry.info.clone())
    }

    /// Deliver a `command` envelope on a locally owned socket.
    pub fn send_command_to_local(&self, client_id: &str, command: &str, data: Value) -> bool {
        let envelope = ControlMessage::Command {
            command: command.to_string(),
            data,
            from: format!("node-{}", self.config.node_id),
        };
        let text = match protocol::encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Command serialization failed");
                return false;
            }
        };

        let delivered = {
            let clients = self.clients.read().expect("local client table poisoned");
            match clients.get(client_id) {
                Some(entry) => entry
                    .sender
                    .send(axum::extract::ws::Message::Text(text.into()))
                    .is_ok(),
                None => false,
            }
        };
        if delivered {
            tracing::info!(client_id = %client_id, command = %command, "Command delivered");
            self.registry.update_activity(client_id);
        } else {
            tracing::warn!(client_id = %client_id, command = %command, "Command delivery failed");
        }
        delivered
    }
}

/// One backend node's server.
pub struct NodeServer {
    router: Router,
    state: Arc<NodeState>,
}

impl NodeServer {
    /// Build the server from configuration; validation failures are
    /// fatal at start-up.
    pub fn new(config: NodeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(ClientRegistry::open(
            &config.registry_path,
            Duration::from_secs(config.offline_after_secs),
        ));
        Self::with_registry(config, registry)
    }

    /// Build the server around an existing registry, so colocated nodes
    /// in one process share their view of connected clients.
    pub fn with_registry(
        config: NodeConfig,
        registry: Arc<ClientRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let port = config
            .bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|_| ConfigError::BadBindAddress(config.bind_address.clone()))?
            .port();

        let state = Arc::new(NodeState {
            config,
            port,
            start_time: protocol::timestamp_ms(),
            registry,
            clients: RwLock::new(HashMap::new()),
            forwarder: reqwest::Client::new(),
            leg_counter: AtomicU64::new(1),
        });

        let router = Router::new()
            .route("/ws", any(ws_handler))
            .route("/health", get(health))
            .route("/api/clients", get(api_clients))
            .route("/api/global-clients", get(api_global_clients))
            .route("/api/query", get(api_query))
            .route("/api/node-info", get(api_node_info))
            .route("/api/send-command", post(api_send_command))
            .with_state(state.clone())
            .layer(TraceLayer::new_for_http());

        Ok(Self { router, state })
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            node = %self.state.config.node_id,
            "Backend node starting"
        );

        let registry = self.state.registry.clone();
        let sweep_interval = Duration::from_secs(self.state.config.sweep_interval_secs);
        let evict_after = Duration::from_secs(self.state.config.evict_after_secs);
        let mut sweeper_shutdown = shutdown_rx.resubscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep(evict_after);
                    }
                    _ = sweeper_shutdown.recv() => return,
                }
            }
        });

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown::wait(&mut shutdown_rx).await;
            })
            .await?;

        tracing::info!(node = %self.state.config.node_id, "Backend node stopped");
        Ok(())
    }
}

async fn ws_handler(State(state): State<Arc<NodeState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session::handle_socket(socket, state))
}

async fn health(State(state): State<Arc<NodeState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "node_id": state.config.node_id,
        "port": state.port,
        "clients": state.local_count(),
        "time": protocol::timestamp_ms(),
    }))
}

async fn api_clients(State(state): State<Arc<NodeState>>) -> Json<Value> {
    let clients = state.local_infos();
    Json(json!({
        "node_id": state.config.node_id,
        "total": clients.len(),
        "clients": clients,
    }))
}

async fn api_global_clients(State(state): State<Arc<NodeState>>) -> Json<Value> {
    let clients = state.registry.get_all();
    Json(json!({
        "current_node": state.config.node_id,
        "total": clients.len(),
        "clients": clients,
    }))
}

#[derive(Deserialize)]
struct QueryParams {
    client_id: Option<String>,
}

async fn api_query(
    State(state): State<Arc<NodeState>>,
    Query(params): Query<QueryParams>,
) -> Response {
    let Some(client_id) = params.client_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing client_id"})),
        )
            .into_response();
    };

    match state.local_info(&client_id) {
        Some(client) => Json(json!({
            "found": true,
            "node_id": state.config.node_id,
            "client": client,
        }))
        .into_response(),
        None => Json(json!({
            "found": false,
            "node_id": state.config.node_id,
            "message": "client not found",
        }))
        .into_response(),
    }
}

async fn api_node_info(State(state): State<Arc<NodeState>>) -> Json<Value> {
    Json(json!({
        "node_id": state.config.node_id,
        "port": state.port,
        "clients": state.local_count(),
        "status": "running",
        "start_time": state.start_time,
        "web_interface": format!("http://localhost:{}/", state.port),
    }))
}

#[derive(Debug, Deserialize)]
struct SendCommandRequest {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    data: Value,
}

async fn api_send_command(
    State(state): State<Arc<NodeState>>,
    Json(request): Json<SendCommandRequest>,
) -> Response {
    if request.client_id.is_empty() || request.command.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "client_id and command are required"})),
        )
            .into_response();
    }

    let Some(record) = state.registry.get(&request.client_id) else {
        return Json(json!({"success": false, "error": "client not found"})).into_response();
    };

    if record.node_id == state.config.node_id {
        let success =
            state.send_command_to_local(&request.client_id, &request.command, request.data);
        return Json(json!({
            "success": success,
            "node": state.config.node_id,
            "message": if success { "command delivered" } else { "command delivery failed" },
        }))
        .into_response();
    }

    // One hop to the owning node, which resolves locally.
    let target = format!("http://127.0.0.1:{}/api/send-command", record.node_port);
    let forward = json!({
        "client_id": request.client_id,
        "command": request.command,
        "data": request.data,
    });
    match state.forwarder.post(&target).json(&forward).send().await {
        Ok(response) => match response.json::<Value>().await {
            Ok(body) => {
                tracing::info!(
                    client_id = %request.client_id,
                    owner = %record.node_id,
                    "Command forwarded"
                );
                Json(body).into_response()
            }
            Err(e) => {
                tracing::warn!(owner = %record.node_id, error = %e, "Bad forward response");
                Json(json!({
                    "success": false,
                    "node": record.node_id,
                    "message": "forward failed",
                }))
                .into_response()
            }
        },
        Err(e) => {
            tracing::warn!(owner = %record.node_id, error = %e, "Command forward failed");
            Json(json!({
                "success": false,
                "node": record.node_id,
                "message": "forward failed",
            }))
            .into_response()
        }
    }
}
