//! Per-socket session handling on a backend node.
//!
//! # Contract
//! 1. The first frame is the registration envelope; missing identity
//!    fields are synthesized
//! 2. The client is visible in the local table and the shared registry
//!    for the entire life of the leg
//! 3. The message loop discriminates on the envelope type; protocol
//!    errors abort only this leg
//! 4. Teardown removes the local entry and unregisters the shared
//!    record, unless a newer leg for the same id has taken over

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::node::server::NodeState;
use crate::protocol::{
    self, ControlMessage, Frame, Registration, RequestEnvelope, ResponseEnvelope,
};

/// Serializable view of one locally connected client.
#[derive(Debug, Clone, Serialize)]
pub struct LocalClientInfo {
    pub id: String,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub conn_time: i64,
    /// Milliseconds since the Unix epoch.
    pub last_seen: i64,
}

/// One live session: its info plus the handle that feeds its socket.
pub struct LocalClient {
    pub info: LocalClientInfo,
    pub sender: mpsc::UnboundedSender<Message>,
    /// Leg generation, so a superseded session cannot erase its
    /// replacement during teardown.
    pub leg: u64,
}

/// Drive one accepted socket to completion.
pub async fn handle_socket(socket: WebSocket, state: Arc<NodeState>) {
    let (mut sink, mut stream) = socket.split();

    // Registration happens-before any application frame on this leg.
    let registration = match stream.next().await {
        Some(Ok(Message::Text(text))) => {
            match serde_json::from_str::<Registration>(&text) {
                Ok(registration) => registration,
                Err(e) => {
                    warn!(error = %e, "Malformed registration envelope");
                    return;
                }
            }
        }
        Some(Ok(Message::Close(_))) | None => {
            debug!("Leg closed before registration");
            return;
        }
        Some(Ok(_)) => {
            warn!("First frame was not a registration envelope");
            return;
        }
        Some(Err(e)) => {
            warn!(error = %e, "Read failed before registration");
            return;
        }
    };

    let client_id = registration
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("client_{}", uuid::Uuid::new_v4().simple()));
    let client_name = registration
        .client_name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| synthesize_name(&client_id));

    // The sink is owned by one writer task; everything else (the read
    // loop, HTTP command dispatch) talks to it through the channel.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let leg = state.next_leg();
    let now = protocol::timestamp_ms();
    {
        let mut clients = state.clients.write().expect("local client table poisoned");
        clients.insert(
            client_id.clone(),
            LocalClient {
                info: LocalClientInfo {
                    id: client_id.clone(),
                    name: client_name.clone(),
                    conn_time: now,
                    last_seen: now,
                },
                sender: tx.clone(),
                leg,
            },
        );
        info!(
            client_id = %client_id,
            client_name = %client_name,
            node = %state.config.node_id,
            connected = clients.len(),
            "Client connected"
        );
    }
    state.registry.register(
        &client_id,
        &client_name,
        &state.config.node_id,
        state.port,
    );

    while let Some(result) = stream.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                state.touch_local(&client_id);
                if !dispatch(&state, &client_id, &tx, &text) {
                    break;
                }
            }
            Message::Close(_) => break,
            // Transport-level control frames are answered by the socket
            // itself; application heartbeats travel as text envelopes.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                debug!(client_id = %client_id, "Ignoring binary frame");
            }
        }
    }

    // Teardown. A newer leg for the same id owns the table entry now if
    // the client reconnected before this leg unwound.
    let still_owner = {
        let mut clients = state.clients.write().expect("local client table poisoned");
        match clients.get(&client_id) {
            Some(entry) if entry.leg == leg => {
                clients.remove(&client_id);
                true
            }
            _ => false,
        }
    };
    if still_owner {
        state.registry.unregister(&client_id);
    }
    drop(tx);
    let _ = writer.await;
    info!(
        client_id = %client_id,
        node = %state.config.node_id,
        remaining = state.local_count(),
        "Client disconnected"
    );
}

/// Handle one text frame. Returns `false` when the leg must be aborted.
fn dispatch(
    state: &Arc<NodeState>,
    client_id: &str,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) -> bool {
    match protocol::decode(text) {
        Ok(Frame::Control(ControlMessage::CommandResponse {
            result, message, ..
        })) => {
            info!(
                client_id = %client_id,
                result = %result,
                message = %message,
                "Command response"
            );
            state.registry.update_activity(client_id);
            true
        }
        Ok(Frame::Control(ControlMessage::Ping { .. })) => {
            let pong = ControlMessage::Pong {
                timestamp: protocol::timestamp_ms(),
            };
            send_envelope(tx, &pong)
        }
        Ok(Frame::Control(ControlMessage::NameResponse { client_name, .. })) => {
            debug!(client_id = %client_id, client_name = %client_name, "Name response");
            state.registry.update_activity(client_id);
            true
        }
        Ok(Frame::Control(other)) => {
            debug!(client_id = %client_id, message = ?other, "Unhandled control message");
            true
        }
        Ok(Frame::Request(request)) => {
            info!(
                client_id = %client_id,
                method = %request.method,
                path = %request.path,
                "Request envelope"
            );
            let response = handle_request(state, &request);
            send_envelope(tx, &response)
        }
        Ok(Frame::Other(value)) => {
            debug!(client_id = %client_id, frame = %value, "Unknown message shape");
            true
        }
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "Protocol error, aborting leg");
            false
        }
    }
}

/// The generic request/response example protocol.
fn handle_request(state: &Arc<NodeState>, request: &RequestEnvelope) -> ResponseEnvelope {
    let node_id = state.config.node_id.as_str();
    match request.method.as_str() {
        "GET" => match request.path.trim_start_matches('/') {
            "info" => ResponseEnvelope::new(
                &request.id,
                200,
                Some(json!({
                    "node_id": node_id,
                    "port": state.port,
                    "clients": state.local_count(),
                    "timestamp": protocol::timestamp_ms(),
                })),
            ),
            "health" => ResponseEnvelope::new(
                &request.id,
                200,
                Some(json!({"status": "ok", "node": node_id})),
            ),
            _ => ResponseEnvelope::new(&request.id, 404, Some(json!({"error": "not found"}))),
        },
        "POST" => ResponseEnvelope::new(
            &request.id,
            201,
            Some(json!({
                "message": "created",
                "node": node_id,
                "data": request.body,
            })),
        ),
        "PUT" => ResponseEnvelope::new(
            &request.id,
            200,
            Some(json!({
                "message": "updated",
                "node": node_id,
                "data": request.body,
            })),
        ),
        "DELETE" => ResponseEnvelope::new(
            &request.id,
            200,
            Some(json!({"message": "deleted", "node": node_id})),
        ),
        _ => ResponseEnvelope::new(&request.id, 405, None),
    }
}

fn send_envelope<T: serde::Serialize>(tx: &mpsc::UnboundedSender<Message>, envelope: &T) -> bool {
    match protocol::encode(envelope) {
        Ok(text) => tx.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            warn!(error = %e, "Envelope serialization failed");
            false
        }
    }
}

/// Display name synthesized from the tail of the id.
fn synthesize_name(client_id: &str) -> String {
    let tail: String = client_id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("client_{tail}")
}
