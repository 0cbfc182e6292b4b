//! Transports, HI handshake, session task orchestration and reconnection for mesh.
//!
//! A [`Session`] carries one logical peer connection over any [`Channel`]:
//! raw TCP, TLS or WebSocket. Outbound peers are kept alive by a
//! [`Supervisor`] that redials at a fixed interval; accepted connections get
//! a single session through [`serve`].
//!
//! ## Features
//!
//! - **Transport**: chunked reads, ordered writes, idempotent close, diagnostics
//! - **TLS**: mTLS server/client configs with peer certificate details
//! - **WebSocket**: the same session semantics over binary WebSocket messages
//! - **Handshake**: HI exchange, client first, server registers before answering
//! - **Supervision**: reconnect every five seconds, forever
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{connect, Session, SessionConfig, NodeLink};
//! use std::sync::Arc;
//!
//! # async fn example<N: NodeLink>(node: Arc<N>) {
//! let factory = move || Session::new(node.clone(), SessionConfig::default());
//! // Never returns while reconnecting is enabled
//! connect("peer.example.net", 7323, factory, None, true).await;
//! # }
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod diagnostics;
pub mod error;
pub mod handshake;
pub mod node;
pub mod session;
pub mod supervisor;
pub mod tasks;
pub mod transport;
pub mod websocket;

pub use channel::Channel;
pub use diagnostics::{log_tls_detail, ConnectionInfo, Diagnostics, TlsContext};
pub use error::{SessionError, SessionResult};
pub use handshake::{parse_hi, send_hi, wait_hi};
pub use node::{NodeLink, SessionLease};
pub use session::{
    watch_queue, Role, Session, SessionConfig, SessionState, DEFAULT_HANDSHAKE_TIMEOUT,
    WRITE_POLL_INTERVAL,
};
pub use supervisor::{
    connect, serve, serve_channel, supervise, Connector, ReconnectPolicy, Supervisor,
    SupervisorState, TcpConnector, WsConnector, RECONNECT_INTERVAL,
};
pub use tasks::{TaskKind, TaskSlot};
pub use transport::tls::{
    accept_tls, connect_tls, make_client_config, make_server_config, tls_acceptor,
    TlsClientConfig, TlsServer, MESH_ALPN,
};
pub use transport::{
    connect_tcp, listen_tcp, IoStream, StreamTransport, Transport, DEFAULT_CHUNK_SIZE,
};
pub use websocket::{accept_ws, connect_ws, WsChannel};
