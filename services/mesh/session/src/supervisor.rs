//! Connection supervision.
//!
//! An outbound peer is dialed, its session run to completion, and after any
//! outcome the supervisor waits a fixed interval and dials again. Accepted
//! connections get exactly one session and are never re-established.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::diagnostics::log_tls_detail;
use crate::error::{SessionError, SessionResult};
use crate::node::NodeLink;
use crate::session::Session;
use crate::transport::tls::{connect_tls, TlsClientConfig};
use crate::transport::{connect_tcp, IoStream, StreamTransport, DEFAULT_CHUNK_SIZE};
use crate::websocket::{connect_ws, WsChannel};

/// Fixed delay between connection attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Something that can open a channel to one peer
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Channel type produced by a successful attempt
    type Channel: Channel;

    /// Human readable peer address for logs
    fn target(&self) -> String;

    /// Make one connection attempt
    async fn connect(&self) -> SessionResult<Arc<Self::Channel>>;
}

/// Dials a TCP peer, optionally wrapping the socket in TLS
#[derive(Clone)]
pub struct TcpConnector {
    /// Peer host name or address
    pub host: String,
    /// Peer port
    pub port: u16,
    /// TLS client settings; plain TCP when `None`
    pub tls: Option<TlsClientConfig>,
    /// Read size of the resulting transport
    pub chunk_size: usize,
}

impl TcpConnector {
    /// Connector for `host:port` with the default read size
    pub fn new(host: impl Into<String>, port: u16, tls: Option<TlsClientConfig>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Channel = StreamTransport;

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> SessionResult<Arc<StreamTransport>> {
        let tcp = connect_tcp(&self.host, self.port)
            .await
            .map_err(|e| SessionError::connect(self.target(), e))?;
        tcp.set_nodelay(true).ok();

        let stream = match &self.tls {
            Some(tls) => connect_tls(tls, tcp)
                .await
                .map_err(|e| SessionError::connect(self.target(), format!("{:#}", e)))?,
            None => IoStream::Plain(tcp),
        };

        Ok(Arc::new(
            StreamTransport::from_stream(stream).with_chunk_size(self.chunk_size),
        ))
    }
}

/// Dials a WebSocket peer
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// `ws://` or `wss://` URL
    pub url: String,
}

#[async_trait]
impl Connector for WsConnector {
    type Channel = WsChannel<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    fn target(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> SessionResult<Arc<Self::Channel>> {
        Ok(Arc::new(connect_ws(&self.url).await?))
    }
}

/// Where a supervisor currently is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Attempting to open a channel
    Connecting,
    /// A session is running
    Connected,
    /// Waiting out the reconnect interval
    Backoff,
}

/// When to try again
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// Stop after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: RECONNECT_INTERVAL,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// A single attempt, no retries
    pub fn once() -> Self {
        Self {
            interval: RECONNECT_INTERVAL,
            max_attempts: Some(1),
        }
    }

    fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Keeps one outbound peer connected
pub struct Supervisor<K, N, F>
where
    K: Connector,
    N: NodeLink,
    F: Fn() -> Session<N> + Send + Sync,
{
    connector: K,
    factory: F,
    policy: ReconnectPolicy,
    state: watch::Sender<SupervisorState>,
    attempts: u32,
}

impl<K, N, F> Supervisor<K, N, F>
where
    K: Connector,
    N: NodeLink,
    F: Fn() -> Session<N> + Send + Sync,
{
    /// Supervise `connector`, building a fresh session per attempt
    pub fn new(connector: K, factory: F, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SupervisorState::Connecting);
        Self {
            connector,
            factory,
            policy,
            state,
            attempts: 0,
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Connect, run, wait, repeat.
    ///
    /// Returns only when the policy allows no further attempt; the result
    /// tells whether the last attempt's session completed cleanly.
    pub async fn run(&mut self) -> bool {
        let target = self.connector.target();
        loop {
            self.state.send_replace(SupervisorState::Connecting);
            self.attempts += 1;
            debug!("Connecting to {} (attempt {})", target, self.attempts);

            let outcome = self.attempt().await;
            match &outcome {
                Ok(()) => info!("Session with {} completed", target),
                Err(e) if e.is_connect() => warn!("Connection to {} failed: {}", target, e),
                Err(e) => error!("Session with {} failed: {}", target, e),
            }

            if !self.policy.allows(self.attempts) {
                return outcome.is_ok();
            }

            self.state.send_replace(SupervisorState::Backoff);
            debug!(
                "Reconnecting to {} in {:?}",
                target, self.policy.interval
            );
            tokio::time::sleep(self.policy.interval).await;
        }
    }

    async fn attempt(&mut self) -> SessionResult<()> {
        let channel = self.connector.connect().await?;
        log_tls_detail(&channel.diagnostics());
        self.state.send_replace(SupervisorState::Connected);

        let mut session = (self.factory)();
        session.client(channel).await
    }
}

/// Supervise any connector with the given policy
pub async fn supervise<K, N, F>(connector: K, factory: F, policy: ReconnectPolicy) -> bool
where
    K: Connector,
    N: NodeLink,
    F: Fn() -> Session<N> + Send + Sync,
{
    Supervisor::new(connector, factory, policy).run().await
}

/// Keep a TCP (or TLS) peer connected
pub async fn connect<N, F>(
    host: &str,
    port: u16,
    factory: F,
    tls: Option<TlsClientConfig>,
    reconnect: bool,
) -> bool
where
    N: NodeLink,
    F: Fn() -> Session<N> + Send + Sync,
{
    let policy = if reconnect {
        ReconnectPolicy::default()
    } else {
        ReconnectPolicy::once()
    };
    supervise(TcpConnector::new(host, port, tls), factory, policy).await
}

/// Run one server session on an accepted stream
pub async fn serve<N, F>(stream: IoStream, factory: F)
where
    N: NodeLink,
    F: FnOnce() -> Session<N>,
{
    serve_channel(Arc::new(StreamTransport::from_stream(stream)), factory).await
}

/// Run one server session on an accepted channel of any kind
pub async fn serve_channel<C, N, F>(channel: Arc<C>, factory: F)
where
    C: Channel,
    N: NodeLink,
    F: FnOnce() -> Session<N>,
{
    let diagnostics = channel.diagnostics();
    log_tls_detail(&diagnostics);

    let mut session = factory();
    if let Err(e) = session.server(channel).await {
        error!(
            "Inbound session from {} failed: {}",
            diagnostics.peer_label(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SessionLease;
    use crate::session::SessionConfig;
    use crate::transport::Transport;
    use mesh_wire::{Envelope, FrameQueue, FramedBuffer};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::{timeout, Instant};

    struct NullNode;

    #[async_trait]
    impl NodeLink for NullNode {
        fn node_id(&self) -> &str {
            "local"
        }
        fn register(&self, _lease: SessionLease) {}
        fn unregister(&self, _remote_id: &str, _lease_id: u64) {}
        fn outbound_buffer(&self, _remote_id: &str) -> Arc<FrameQueue> {
            Arc::new(FrameQueue::new())
        }
        async fn advertise_routes(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn handle_inbound(&self, _remote_id: String, _inbound: Arc<FramedBuffer>) {
            std::future::pending::<()>().await
        }
    }

    struct Unreachable {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for Unreachable {
        type Channel = Transport<tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>>;

        fn target(&self) -> String {
            "peer.invalid:7323".to_string()
        }

        async fn connect(&self) -> SessionResult<Arc<Self::Channel>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::connect(self.target(), "connection refused"))
        }
    }

    /// Peer that answers the HI and then hangs up
    #[derive(Default)]
    struct ShortLived {
        connects: Arc<Mutex<Vec<Instant>>>,
        handshakes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for ShortLived {
        type Channel = Transport<tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>>;

        fn target(&self) -> String {
            "remote:7323".to_string()
        }

        async fn connect(&self) -> SessionResult<Arc<Self::Channel>> {
            self.connects.lock().unwrap().push(Instant::now());

            let (local, mut remote) = tokio::io::duplex(4096);
            let handshakes = self.handshakes.clone();
            tokio::spawn(async move {
                let mut hi = vec![0u8; 1024];
                if remote.read(&mut hi).await.unwrap_or(0) == 0 {
                    return;
                }
                let reply = Envelope::hi("remote").encode().unwrap();
                if remote.write_all(&reply).await.is_ok() {
                    handshakes.fetch_add(1, Ordering::SeqCst);
                }
            });

            let (reader, writer) = tokio::io::split(local);
            Ok(Arc::new(Transport::new(
                reader,
                writer,
                crate::diagnostics::ConnectionInfo::default(),
            )))
        }
    }

    fn factory() -> impl Fn() -> Session<NullNode> + Send + Sync {
        let node = Arc::new(NullNode);
        move || Session::new(node.clone(), SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_forever_at_fixed_interval() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = Unreachable {
            attempts: attempts.clone(),
        };

        // 26 seconds covers attempts at 0, 5, 10, 15, 20 and 25
        let result = timeout(
            Duration::from_secs(26),
            supervise(connector, factory(), ReconnectPolicy::default()),
        )
        .await;

        assert!(result.is_err(), "supervisor must never give up");
        assert!(attempts.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut supervisor = Supervisor::new(
            Unreachable {
                attempts: attempts.clone(),
            },
            factory(),
            ReconnectPolicy::once(),
        );
        let states = supervisor.subscribe();

        assert!(!supervisor.run().await);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.attempts(), 1);
        assert_eq!(*states.borrow(), SupervisorState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enters_backoff_between_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut supervisor = Supervisor::new(
            Unreachable {
                attempts: attempts.clone(),
            },
            factory(),
            ReconnectPolicy {
                interval: Duration::from_secs(5),
                max_attempts: Some(2),
            },
        );
        let mut states = supervisor.subscribe();

        let run = tokio::spawn(async move { supervisor.run().await });
        states
            .wait_for(|s| *s == SupervisorState::Backoff)
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        assert!(!run.await.unwrap());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_serve_runs_one_session() {
        let (local, remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let channel = Arc::new(Transport::new(
            reader,
            writer,
            crate::diagnostics::ConnectionInfo::default(),
        ));

        // Peer hangs up without a HI; serve logs and returns
        drop(remote);
        timeout(
            Duration::from_secs(5),
            serve_channel(channel.clone(), || {
                Session::new(Arc::new(NullNode), SessionConfig::default())
            }),
        )
        .await
        .unwrap();
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_completed_session() {
        let connector = ShortLived::default();
        let connects = connector.connects.clone();
        let handshakes = connector.handshakes.clone();
        let mut supervisor = Supervisor::new(connector, factory(), ReconnectPolicy::default());
        let mut states = supervisor.subscribe();
        let run = tokio::spawn(async move { supervisor.run().await });

        states
            .wait_for(|s| *s == SupervisorState::Connected)
            .await
            .unwrap();
        states
            .wait_for(|s| *s == SupervisorState::Backoff)
            .await
            .unwrap();
        let ended = Instant::now();
        assert_eq!(connects.lock().unwrap().len(), 1);
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);

        states
            .wait_for(|s| *s == SupervisorState::Connecting)
            .await
            .unwrap();
        timeout(Duration::from_secs(1), async {
            while connects.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let second = connects.lock().unwrap()[1];
        assert!(second - ended >= RECONNECT_INTERVAL);
        run.abort();
    }

    #[tokio::test]
    async fn test_connect_without_reconnect_tries_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // Returning well inside the reconnect interval means no second attempt
        let connected = timeout(
            RECONNECT_INTERVAL - Duration::from_secs(1),
            connect("127.0.0.1", port, factory(), None, false),
        )
        .await
        .unwrap();
        assert!(!connected);
    }
}
