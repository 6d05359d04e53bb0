//! End-to-end splice, session registration and command dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use wsgate::config::{BackendEntry, NodeConfig, ProxyConfig, Strategy};
use wsgate::node::registry::ClientRegistry;
use wsgate::proxy::registry::BackendRegistry;
use wsgate::{NodeServer, ProxyServer, Shutdown};

mod common;

async fn spawn_node(config: NodeConfig, shutdown: &Shutdown) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = NodeServer::new(config).unwrap();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    addr
}

async fn spawn_node_with_registry(
    config: NodeConfig,
    registry: Arc<ClientRegistry>,
    shutdown: &Shutdown,
) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = NodeServer::with_registry(config, registry).unwrap();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    addr
}

async fn spawn_proxy(
    config: ProxyConfig,
    shutdown: &Shutdown,
) -> (SocketAddr, Arc<BackendRegistry>) {
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(config).unwrap();
    let registry = server.registry();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    (addr, registry)
}

fn node_config(port: u16, node_id: &str, registry_path: String) -> NodeConfig {
    NodeConfig {
        bind_address: format!("127.0.0.1:{port}"),
        node_id: node_id.to_string(),
        registry_path,
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn splice_registers_session_and_tears_down_cleanly() {
    let shutdown = Shutdown::new();
    let node = spawn_node(
        node_config(28511, "alpha", common::scratch_registry("splice")),
        &shutdown,
    )
    .await;

    let mut config = ProxyConfig {
        bind_address: "127.0.0.1:28510".to_string(),
        strategy: Strategy::RoundRobin,
        ..ProxyConfig::default()
    };
    config.backends.push(BackendEntry {
        id: "alpha".into(),
        http_port: node.port(),
    });
    config.health_check.enabled = false;
    let (proxy, proxy_registry) = spawn_proxy(config, &shutdown).await;

    let (mut ws, _) = connect_async(format!("ws://{proxy}/ws")).await.unwrap();
    ws.send(Message::text(
        json!({"client_id": "it-client", "client_name": "tester", "timestamp": 1}).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // The splice accounts for exactly one live connection.
    assert_eq!(proxy_registry.connections("alpha"), Some(1));

    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let clients: Value = http
        .get(format!("http://{node}/api/clients"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clients["total"], 1);
    assert_eq!(clients["clients"][0]["id"], "it-client");

    // A request envelope round-trips through the splice in both
    // directions.
    ws.send(Message::text(
        json!({"id": "r1", "method": "GET", "path": "/info", "timestamp": 2}).to_string(),
    ))
    .await
    .unwrap();
    let reply = loop {
        match ws.next().await.expect("socket closed early").unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(reply["id"], "r1");
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["body"]["node_id"], "alpha");

    // Application heartbeat.
    ws.send(Message::text(json!({"type": "ping", "timestamp": 3}).to_string()))
        .await
        .unwrap();
    let pong = loop {
        match ws.next().await.expect("socket closed early").unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(pong["type"], "pong");

    // The admin fan-out sees the session.
    let all: Value = http
        .get(format!("http://{proxy}/api/all-clients"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all["healthy_nodes"], 1);
    assert!(all["clients"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["id"] == "it-client"));

    // Teardown returns the counter to zero and clears the session.
    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(proxy_registry.connections("alpha"), Some(0));

    let clients: Value = http
        .get(format!("http://{node}/api/clients"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clients["total"], 0);

    shutdown.trigger();
}

#[tokio::test]
async fn command_dispatch_reaches_client_across_nodes() {
    let shutdown = Shutdown::new();
    let registry = Arc::new(ClientRegistry::open(
        common::scratch_registry("dispatch"),
        Duration::from_secs(30),
    ));

    let alpha = spawn_node_with_registry(
        node_config(28521, "alpha", common::scratch_registry("dispatch-a")),
        registry.clone(),
        &shutdown,
    )
    .await;
    let beta = spawn_node_with_registry(
        node_config(28522, "beta", common::scratch_registry("dispatch-b")),
        registry.clone(),
        &shutdown,
    )
    .await;

    // Client registers on alpha.
    let (mut ws, _) = connect_async(format!("ws://{alpha}/ws")).await.unwrap();
    ws.send(Message::text(
        json!({"client_id": "cmd-target", "client_name": "target", "timestamp": 1}).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // An admin posts the command to beta; it forwards one hop to alpha.
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let result: Value = http
        .post(format!("http://{beta}/api/send-command"))
        .json(&json!({"client_id": "cmd-target", "command": "refresh", "data": {"force": true}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["node"], "alpha");

    // The command envelope arrives on the client's socket.
    let command = loop {
        match ws.next().await.expect("socket closed early").unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(command["type"], "command");
    assert_eq!(command["command"], "refresh");
    assert_eq!(command["data"]["force"], true);
    assert_eq!(command["from"], "node-alpha");

    shutdown.trigger();
}

#[tokio::test]
async fn concurrent_splices_account_and_drain() {
    let shutdown = Shutdown::new();
    let node = spawn_node(
        node_config(28531, "alpha", common::scratch_registry("drain")),
        &shutdown,
    )
    .await;

    let mut config = ProxyConfig {
        bind_address: "127.0.0.1:28530".to_string(),
        strategy: Strategy::RoundRobin,
        ..ProxyConfig::default()
    };
    config.backends.push(BackendEntry {
        id: "alpha".into(),
        http_port: node.port(),
    });
    config.health_check.enabled = false;
    let (proxy, proxy_registry) = spawn_proxy(config, &shutdown).await;

    let mut sessions = Vec::new();
    for i in 0..3 {
        let (mut ws, _) = connect_async(format!("ws://{proxy}/ws")).await.unwrap();
        ws.send(Message::text(
            json!({"client_id": format!("bulk-{i}"), "timestamp": 1}).to_string(),
        ))
        .await
        .unwrap();
        sessions.push(ws);
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(proxy_registry.connections("alpha"), Some(3));

    for mut ws in sessions {
        ws.close(None).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(proxy_registry.connections("alpha"), Some(0));

    shutdown.trigger();
}
