//! Mesh network node binary.
//!
//! `mesh node` runs a node: the mesh listener (plain or mTLS), optional
//! WebSocket listener, supervised outbound peers, the local control socket
//! and the periodic expiry sweep. `mesh send` delivers one directive to a
//! running node through its control socket.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

mod config;
mod logging;
mod mainloop;
mod node;

use config::{MeshConfig, DEFAULT_SOCKET_PATH};
use logging::init_logging;

/// Mesh network node
#[derive(Parser, Debug)]
#[command(name = "mesh", version, about = "Mesh network node and control client")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a mesh node until interrupted
    Node {
        /// Configuration file path
        #[arg(long, default_value = "mesh.yaml")]
        config: PathBuf,

        /// Node id announced to peers
        #[arg(long)]
        node_id: Option<String>,

        /// Mesh listener port
        #[arg(long)]
        listen_port: Option<u16>,

        /// Outbound peer as host:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Outbound WebSocket peer URL (repeatable)
        #[arg(long = "ws-peer")]
        ws_peers: Vec<String>,

        /// Control socket path
        #[arg(long)]
        socket_path: Option<PathBuf>,

        /// Delay between reconnect attempts, e.g. 5s
        #[arg(long)]
        reconnect_interval: Option<humantime::Duration>,
    },

    /// Send a directive to a running node
    Send {
        /// Node id the directive is for
        recipient: String,

        /// Directive name, e.g. ping
        directive: String,

        /// Payload; `-` reads it from stdin
        #[arg(default_value = "")]
        payload: String,

        /// Control socket of the local node
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    match args.command {
        Command::Node {
            config,
            node_id,
            listen_port,
            peers,
            ws_peers,
            socket_path,
            reconnect_interval,
        } => {
            info!("Starting mesh node v{}", env!("CARGO_PKG_VERSION"));

            let mut mesh_config = MeshConfig::load_from_file(&config)?;
            if let Some(node_id) = node_id {
                mesh_config.node_id = node_id;
            }
            if let Some(port) = listen_port {
                mesh_config.listen_port = port;
            }
            if let Some(path) = socket_path {
                mesh_config.socket_path = path;
            }
            if let Some(interval) = reconnect_interval {
                mesh_config.reconnect_interval = interval.into();
            }
            mesh_config.peers.extend(peers);
            mesh_config.ws_peers.extend(ws_peers);

            mainloop::run(mesh_config, shutdown_signal()).await
        }
        Command::Send {
            recipient,
            directive,
            payload,
            socket_path,
        } => {
            mesh_control::send_directive(
                &directive,
                &recipient,
                &payload,
                &socket_path,
                tokio::io::stdin(),
                tokio::io::stdout(),
            )
            .await?;
            Ok(())
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Interrupted"),
        _ = terminate => info!("Terminated"),
    }
}
