//! HTTP front door.
//!
//! # Responsibilities
//! - Fingerprint every request and refresh the affinity cookie
//! - Dispatch: upgrade requests to the splicer, everything else through
//!   the transparent reverse proxy
//! - Serve the two local admin endpoints, which bypass selection
//! - Spawn the health prober and the affinity sweeper
//!
//! # Design Decisions
//! - Hop-by-hop headers are stripped in both directions; end-to-end
//!   headers and bodies pass through untouched
//! - Backend failures surface as 502/503 without naming the backend to
//!   anonymous clients; admins see identities via the admin endpoints

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, FromRequestParts, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::{AffinityConfig, ProxyConfig};
use crate::lifecycle::shutdown;
use crate::proxy::fingerprint::fingerprint;
use crate::proxy::prober::HealthProber;
use crate::proxy::registry::{BackendRegistry, BackendSnapshot};
use crate::proxy::selector::Selector;
use crate::proxy::splice;

/// Headers that are meaningful only for a single transport hop.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Application state injected into handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<BackendRegistry>,
    pub selector: Arc<Selector>,
    pub config: Arc<ProxyConfig>,
    /// Streaming client for the reverse-proxy data path.
    upstream: Client<HttpConnector, Body>,
    /// Convenience client for the admin fan-out.
    admin: reqwest::Client,
}

/// The proxy's HTTP server.
pub struct ProxyServer {
    router: Router,
    config: ProxyConfig,
    registry: Arc<BackendRegistry>,
    selector: Arc<Selector>,
}

impl ProxyServer {
    /// Build the server from configuration; validation failures are
    /// fatal at start-up.
    pub fn new(config: ProxyConfig) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        let registry = Arc::new(BackendRegistry::new());
        for backend in &config.backends {
            registry.add(&backend.id, backend.http_port);
        }
        let selector = Arc::new(Selector::new(config.strategy));

        let upstream = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let state = ProxyState {
            registry: registry.clone(),
            selector: selector.clone(),
            config: Arc::new(config.clone()),
            upstream,
            admin: reqwest::Client::new(),
        };

        let router = Router::new()
            .route("/api/global-clients", get(admin_global_clients))
            .route("/api/all-clients", get(admin_all_clients))
            .route("/", any(entry))
            .route("/{*path}", any(entry))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        Ok(Self {
            router,
            config,
            registry,
            selector,
        })
    }

    pub fn registry(&self) -> Arc<BackendRegistry> {
        self.registry.clone()
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
            strategy = %self.config.strategy,
            backends = self.config.backends.len(),
            "Proxy starting"
        );

        if self.config.health_check.enabled {
            let prober = HealthProber::new(self.registry.clone(), self.config.health_check.clone());
            let prober_shutdown = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                prober.run(prober_shutdown).await;
            });
        }

        let selector = self.selector.clone();
        let ttl = Duration::from_secs(self.config.affinity.ttl_secs);
        let mut sweeper_shutdown = shutdown_rx.resubscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        selector.affinity().sweep(ttl);
                    }
                    _ = sweeper_shutdown.recv() => return,
                }
            }
        });

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown::wait(&mut shutdown_rx).await;
            })
            .await?;

        tracing::info!("Proxy stopped");
        Ok(())
    }
}

/// Main dispatch handler for every non-admin request.
async fn entry(
    State(state): State<ProxyState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let fp = fingerprint(
        request.headers(),
        remote,
        &state.config.affinity.cookie_name,
    );

    let snapshot = state.registry.snapshot();
    let Some(backend) = state.selector.select(&fp, &snapshot) else {
        tracing::warn!(path = %request.uri().path(), "No backend available");
        let mut response =
            (StatusCode::SERVICE_UNAVAILABLE, "no backend available").into_response();
        set_affinity_cookie(&mut response, &state.config.affinity, &fp);
        return response;
    };

    let mut response = if is_upgrade_request(request.headers()) {
        let (mut parts, _body) = request.into_parts();
        match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => {
                let query = parts.uri.query().map(str::to_string);
                tracing::debug!(backend = %backend.id, fingerprint = %fp, "Upgrade admitted");
                splice::handle_upgrade(
                    ws,
                    state.registry.clone(),
                    backend,
                    query,
                    Duration::from_secs(state.config.connect_timeout_secs),
                )
            }
            Err(rejection) => rejection.into_response(),
        }
    } else {
        forward_http(&state, backend, request).await
    };

    set_affinity_cookie(&mut response, &state.config.affinity, &fp);
    response
}

/// True when the request carries the WebSocket upgrade headers.
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Transparent reverse proxy for plain HTTP.
async fn forward_http(
    state: &ProxyState,
    backend: BackendSnapshot,
    mut request: Request<Body>,
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let target = format!("{}{}", backend.http_base, path_and_query);
    let uri = match target.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(backend = %backend.id, target = %target, error = %e, "URI rewrite failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "URI rewrite failed").into_response();
        }
    };
    *request.uri_mut() = uri;
    strip_hop_by_hop(request.headers_mut());

    match state.upstream.request(request).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            tracing::error!(backend = %backend.id, error = %e, "Upstream request failed");
            (StatusCode::BAD_GATEWAY, "upstream request failed").into_response()
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Append the affinity cookie so subsequent requests from this browser
/// collapse onto the cookie path. Deliberately not HttpOnly: front-end
/// scripts dial WebSockets with it.
fn set_affinity_cookie(response: &mut Response, config: &AffinityConfig, fingerprint: &str) {
    let cookie = format!(
        "{}={}; Path=/; Max-Age={}",
        config.cookie_name, fingerprint, config.cookie_max_age_secs
    );
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

/// The proxy's own registry view. The proxy holds no client registry
/// state; the aggregated view lives at `/api/all-clients`.
async fn admin_global_clients() -> Json<Value> {
    Json(json!({
        "source": "proxy",
        "total": 0,
        "clients": [],
    }))
}

/// Fan out to every healthy backend's `/api/global-clients`, deduplicate
/// by client id (last writer wins) and return the merged view.
async fn admin_all_clients(State(state): State<ProxyState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let healthy_nodes = snapshot.iter().filter(|b| b.healthy).count();

    let mut merged: HashMap<String, Value> = HashMap::new();
    for backend in snapshot.iter().filter(|b| b.healthy) {
        let url = format!("{}/api/global-clients", backend.http_base);
        let body: Value = match state.admin.get(&url).send().await {
            Ok(response) => match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(backend = %backend.id, error = %e, "Bad client payload from node");
                    continue;
                }
            },
            Err(e) => {
                tracing::warn!(backend = %backend.id, error = %e, "Node query failed");
                continue;
            }
        };
        if let Some(clients) = body.get("clients").and_then(Value::as_array) {
            for client in clients {
                if let Some(id) = client.get("id").and_then(Value::as_str) {
                    merged.insert(id.to_string(), client.clone());
                }
            }
        }
    }

    let clients: Vec<Value> = merged.into_values().collect();
    Json(json!({
        "source": "aggregated_from_all_nodes",
        "total": clients.len(),
        "clients": clients,
        "nodes_queried": snapshot.len(),
        "healthy_nodes": healthy_nodes,
    }))
}
