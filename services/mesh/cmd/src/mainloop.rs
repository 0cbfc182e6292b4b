//! Node composition: listeners, supervised peers, control socket and expiry.

use anyhow::{Context, Result};
use mesh_control::{remove_socket, ControlListener};
use mesh_session::{
    accept_tls, accept_ws, listen_tcp, make_client_config, make_server_config, serve,
    serve_channel, supervise, tls_acceptor, IoStream, ReconnectPolicy, Session, SessionConfig,
    TcpConnector, TlsClientConfig, TlsServer, WsConnector,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::config::{MeshConfig, TlsConfig};
use crate::node::Node;
use crate::{component_error, component_info, component_warn};

/// How long the control listener gets to clean up after shutdown is signalled
const CONTROL_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Builds a fresh session for every accepted or dialed connection
#[derive(Clone)]
pub struct SessionFactory {
    node: Arc<Node>,
    config: SessionConfig,
}

impl SessionFactory {
    /// Sessions for `node` built with `config`
    pub fn new(node: Arc<Node>, config: SessionConfig) -> Self {
        Self { node, config }
    }

    /// A fresh session for one connection
    pub fn build(&self) -> Session<Node> {
        Session::new(self.node.clone(), self.config.clone())
    }
}

struct TlsSetup {
    server: TlsServer,
    client: TlsClientConfig,
}

async fn load_tls(tls: &TlsConfig) -> Result<Option<TlsSetup>> {
    if !tls.enabled {
        return Ok(None);
    }

    info!(
        "Loading TLS configuration from cert={:?}, key={:?}, ca={:?}",
        tls.cert_file, tls.key_file, tls.ca_file
    );
    let cert_pem = tokio::fs::read_to_string(&tls.cert_file)
        .await
        .with_context(|| format!("Failed to read certificate file {:?}", tls.cert_file))?;
    let key_pem = tokio::fs::read_to_string(&tls.key_file)
        .await
        .with_context(|| format!("Failed to read private key file {:?}", tls.key_file))?;
    let ca_pem = tokio::fs::read_to_string(&tls.ca_file)
        .await
        .with_context(|| format!("Failed to read CA file {:?}", tls.ca_file))?;

    let server = tls_acceptor(make_server_config(&cert_pem, &key_pem, &ca_pem)?);
    let client = TlsClientConfig {
        client_config: Arc::new(make_client_config(&cert_pem, &key_pem, &ca_pem)?),
        server_name: tls.server_name.clone().unwrap_or_default(),
    };

    info!("TLS configuration loaded successfully");
    Ok(Some(TlsSetup { server, client }))
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsServer>,
    factory: SessionFactory,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        component_warn!("listener", "Accept error: {}", e);
                        continue;
                    }
                };
                component_info!("listener", "Accepted connection from {}", peer_addr);
                tcp_stream.set_nodelay(true).ok();

                let tls = tls.clone();
                let factory = factory.clone();
                connections.spawn(async move {
                    let stream = match tls {
                        Some(acceptor) => match accept_tls(&acceptor, tcp_stream).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!("TLS handshake failed with {}: {:#}", peer_addr, e);
                                return;
                            }
                        },
                        None => IoStream::Plain(tcp_stream),
                    };
                    serve(stream, || factory.build()).await;
                });
            }
        }
    }
}

async fn ws_accept_loop(
    listener: TcpListener,
    factory: SessionFactory,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        component_warn!("websocket", "Accept error: {}", e);
                        continue;
                    }
                };

                let factory = factory.clone();
                connections.spawn(async move {
                    match accept_ws(tcp_stream).await {
                        Ok(channel) => serve_channel(Arc::new(channel), || factory.build()).await,
                        Err(e) => warn!("WebSocket upgrade failed with {}: {}", peer_addr, e),
                    }
                });
            }
        }
    }
}

/// Run the node until `shutdown` resolves, then remove the control socket.
///
/// Every listener is bound before the control socket is created, so a bind
/// failure leaves nothing behind.
pub async fn run(config: MeshConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let peers = config.peer_targets()?;
    let node = Arc::new(Node::new(config.node_id.clone(), config.route_ttl));
    let factory = SessionFactory::new(
        node.clone(),
        SessionConfig {
            handshake_timeout: config.handshake_timeout,
            ..SessionConfig::default()
        },
    );
    let tls = load_tls(&config.tls).await?;
    let policy = ReconnectPolicy {
        interval: config.reconnect_interval,
        max_attempts: None,
    };

    let listen_addr = config.listen_addr();
    let listener = listen_tcp(
        listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address {}", listen_addr))?,
    )
    .await
    .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    info!("Serving on {} (TLS: {})", listen_addr, tls.is_some());

    let ws_listener = match &config.ws_listen {
        Some(ws_addr) => {
            let ws_listener = TcpListener::bind(ws_addr.as_str())
                .await
                .with_context(|| format!("Failed to listen for WebSocket on {}", ws_addr))?;
            component_info!("websocket", "Serving WebSocket on {}", ws_addr);
            Some(ws_listener)
        }
        None => None,
    };

    let control = ControlListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to open control socket {:?}", config.socket_path))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn(accept_loop(
        listener,
        tls.as_ref().map(|t| t.server.clone()),
        factory.clone(),
        shutdown_rx.clone(),
    )));

    if let Some(ws_listener) = ws_listener {
        tasks.push(tokio::spawn(ws_accept_loop(
            ws_listener,
            factory.clone(),
            shutdown_rx.clone(),
        )));
    }

    let control_task = tokio::spawn(control.run(node.clone(), shutdown_rx.clone()));
    tasks.push(tokio::spawn(node.clone().watch_expire(config.expiry_interval)));

    for (host, port) in peers {
        let tls_client = tls.as_ref().map(|t| TlsClientConfig {
            client_config: t.client.client_config.clone(),
            server_name: config
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| host.clone()),
        });
        let mut connector = TcpConnector::new(host.clone(), port, tls_client);
        connector.chunk_size = config.chunk_size;

        component_info!("supervisor", "Supervising peer {}:{}", host, port);
        let factory = factory.clone();
        let policy = policy.clone();
        tasks.push(tokio::spawn(async move {
            supervise(connector, move || factory.build(), policy).await;
        }));
    }

    for url in &config.ws_peers {
        component_info!("supervisor", "Supervising WebSocket peer {}", url);
        let connector = WsConnector { url: url.clone() };
        let factory = factory.clone();
        let policy = policy.clone();
        tasks.push(tokio::spawn(async move {
            supervise(connector, move || factory.build(), policy).await;
        }));
    }

    info!("Node {} running", config.node_id);
    shutdown.await;
    info!("Shutting down node {}", config.node_id);

    shutdown_tx.send_replace(true);
    if tokio::time::timeout(CONTROL_SHUTDOWN_GRACE, control_task)
        .await
        .is_err()
    {
        component_error!("control", "Control listener did not stop in time");
    }
    for task in tasks {
        task.abort();
    }
    remove_socket(&config.socket_path);

    info!("Node shutdown complete");
    Ok(())
}
