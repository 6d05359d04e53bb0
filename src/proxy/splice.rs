//! Duplex splicing of one client leg onto one backend leg.
//!
//! # Responsibilities
//! - Dial the backend's upgrade endpoint, carrying the original query
//! - Run two independent forwarders, one per direction
//! - Guarantee ordered teardown and exactly-once connection accounting
//!
//! # Design Decisions
//! - Frames are forwarded verbatim, preserving text/binary/control
//!   opcodes; no buffering above the transport
//! - The first error from either direction tears the whole session down;
//!   a broken session is never retried, the client reconnects

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as TgMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::proxy::registry::{BackendRegistry, BackendSnapshot, ConnectionGuard};

/// WebSocket close code 1011 ("internal error"), sent to the client when
/// the backend leg cannot be established.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Complete the client upgrade and splice it onto `backend`.
pub fn handle_upgrade(
    ws: WebSocketUpgrade,
    registry: Arc<BackendRegistry>,
    backend: BackendSnapshot,
    query: Option<String>,
    connect_timeout: Duration,
) -> Response {
    ws.on_upgrade(move |socket| splice(socket, registry, backend, query, connect_timeout))
}

async fn splice(
    mut client_ws: WebSocket,
    registry: Arc<BackendRegistry>,
    backend: BackendSnapshot,
    query: Option<String>,
    connect_timeout: Duration,
) {
    let mut backend_url = match Url::parse(&backend.ws_address) {
        Ok(url) => url,
        Err(e) => {
            warn!(backend = %backend.id, error = %e, "Bad upgrade address");
            let _ = client_ws
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: "internal error".into(),
                })))
                .await;
            return;
        }
    };
    backend_url.set_query(query.as_deref());

    let backend_ws =
        match tokio::time::timeout(connect_timeout, connect_async(backend_url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(backend = %backend.id, error = %e, "Backend leg dial failed");
                let _ = client_ws
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: "internal error".into(),
                    })))
                    .await;
                return;
            }
            Err(_) => {
                warn!(backend = %backend.id, "Backend leg dial timed out");
                let _ = client_ws
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: "internal error".into(),
                    })))
                    .await;
                return;
            }
        };

    // From here on the decrement is owed exactly once, whichever leg
    // fails first.
    let _guard = ConnectionGuard::acquire(registry, &backend.id);
    info!(backend = %backend.id, "Splice established");

    let (mut backend_sink, mut backend_stream) = backend_ws.split();
    let (mut client_sink, mut client_stream) = client_ws.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_stream.next().await {
            if let Err(e) = backend_sink.send(client_frame_to_backend(msg)).await {
                debug!(backend = %backend.id, error = %e, "Forward to backend failed");
                break;
            }
        }
    };

    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_stream.next().await {
            let Some(forwarded) = backend_frame_to_client(msg) else {
                continue;
            };
            if let Err(e) = client_sink.send(forwarded).await {
                debug!(backend = %backend.id, error = %e, "Forward to client failed");
                break;
            }
        }
    };

    // Whichever direction errors or reaches EOF first initiates teardown;
    // closing both sinks lets the peers drain to EOF.
    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }

    let _ = backend_sink.close().await;
    let _ = client_sink.close().await;

    info!(backend = %backend.id, "Splice closed");
}

fn client_frame_to_backend(msg: Message) -> TgMessage {
    match msg {
        Message::Text(t) => TgMessage::Text(t.to_string().into()),
        Message::Binary(b) => TgMessage::Binary(b.into()),
        Message::Ping(p) => TgMessage::Ping(p.into()),
        Message::Pong(p) => TgMessage::Pong(p.into()),
        Message::Close(c) => TgMessage::Close(c.map(close_frame_to_backend)),
    }
}

fn backend_frame_to_client(msg: TgMessage) -> Option<Message> {
    let converted = match msg {
        TgMessage::Text(t) => Message::Text(t.to_string().into()),
        TgMessage::Binary(b) => Message::Binary(b.into()),
        TgMessage::Ping(p) => Message::Ping(p.into()),
        TgMessage::Pong(p) => Message::Pong(p.into()),
        TgMessage::Close(c) => Message::Close(c.map(close_frame_to_client)),
        // Raw frames never surface from a read loop.
        TgMessage::Frame(_) => return None,
    };
    Some(converted)
}

fn close_frame_to_backend(cf: CloseFrame) -> tungstenite::protocol::CloseFrame {
    tungstenite::protocol::CloseFrame {
        code: cf.code.into(),
        reason: cf.reason.to_string().into(),
    }
}

fn close_frame_to_client(cf: tungstenite::protocol::CloseFrame) -> CloseFrame {
    CloseFrame {
        code: cf.code.into(),
        reason: cf.reason.to_string().into(),
    }
}
