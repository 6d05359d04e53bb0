//! Binary entry point: one executable, two roles.
//!
//! ```text
//! wsgate proxy   --port 8080 --strategy round_robin \
//!                --backend node1=8081 --backend node2=8082
//! wsgate backend --port 8081 --node node1
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsgate::config::{BackendEntry, NodeConfig, ProxyConfig, Strategy};
use wsgate::{NodeServer, ProxyServer, Shutdown};

#[derive(Parser)]
#[command(name = "wsgate")]
#[command(about = "WebSocket-aware layer-7 reverse proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy front door
    Proxy {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        #[arg(short, long, value_enum, default_value_t = Strategy::RoundRobin)]
        strategy: Strategy,

        /// Backend node as id=port; repeat for each node
        #[arg(short, long = "backend", value_parser = parse_backend)]
        backends: Vec<BackendEntry>,
    },
    /// Run a backend node
    Backend {
        #[arg(short, long, default_value_t = 8081)]
        port: u16,

        #[arg(short, long, default_value = "node1")]
        node: String,

        /// Path of the shared client registry file
        #[arg(long, default_value = "global_clients.json")]
        registry_file: String,
    },
}

fn parse_backend(value: &str) -> Result<BackendEntry, String> {
    let (id, port) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=port, got '{value}'"))?;
    if id.is_empty() {
        return Err(format!("empty backend id in '{value}'"));
    }
    let http_port = port
        .parse()
        .map_err(|e| format!("bad port in '{value}': {e}"))?;
    Ok(BackendEntry {
        id: id.to_string(),
        http_port,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsgate=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let shutdown = Shutdown::new();

    match cli.command {
        Commands::Proxy {
            port,
            strategy,
            backends,
        } => {
            let mut config = ProxyConfig {
                bind_address: format!("0.0.0.0:{port}"),
                strategy,
                ..ProxyConfig::default()
            };
            config.backends = if backends.is_empty() {
                // The conventional three-node local fleet.
                vec![
                    BackendEntry { id: "node1".into(), http_port: 8081 },
                    BackendEntry { id: "node2".into(), http_port: 8082 },
                    BackendEntry { id: "node3".into(), http_port: 8083 },
                ]
            } else {
                backends
            };

            let bind_address = config.bind_address.clone();
            let server = ProxyServer::new(config)?;
            let listener = TcpListener::bind(&bind_address).await?;
            server.run(listener, shutdown.subscribe()).await?;
        }
        Commands::Backend {
            port,
            node,
            registry_file,
        } => {
            let config = NodeConfig {
                bind_address: format!("0.0.0.0:{port}"),
                node_id: node,
                registry_path: registry_file,
                ..NodeConfig::default()
            };

            let bind_address = config.bind_address.clone();
            let server = NodeServer::new(config)?;
            let listener = TcpListener::bind(&bind_address).await?;
            server.run(listener, shutdown.subscribe()).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
