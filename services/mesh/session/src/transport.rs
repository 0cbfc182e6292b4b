//! TCP and TLS transport for mesh sessions.
//!
//! [`IoStream`] unifies plain and TLS sockets; [`Transport`] wraps one
//! established connection as a chunked reader, an ordered writer, a
//! monotonic closed flag and a diagnostics snapshot.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::diagnostics::{ConnectionInfo, Diagnostics};
use crate::error::SessionResult;

/// Default number of bytes requested per read
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS client stream
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Capture peer and TLS details of this stream
    pub fn connection_info(&self) -> ConnectionInfo {
        let peer = self.peer_addr().ok();
        match self {
            IoStream::Plain(_) => ConnectionInfo::plain(peer),
            IoStream::Tls(stream) => ConnectionInfo::from_tls(peer, stream.get_ref().1),
            IoStream::TlsClient(stream) => ConnectionInfo::from_tls(peer, stream.get_ref().1),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP host and port
pub async fn connect_tcp(host: &str, port: u16) -> tokio::io::Result<TcpStream> {
    TcpStream::connect((host, port)).await
}

/// One established connection exposed as chunked reads and ordered writes
pub struct Transport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<Option<W>>,
    closed: AtomicBool,
    chunk_size: usize,
    info: ConnectionInfo,
}

/// Transport over a plain or TLS socket
pub type StreamTransport = Transport<ReadHalf<IoStream>, WriteHalf<IoStream>>;

impl StreamTransport {
    /// Wrap an accepted or dialed stream
    pub fn from_stream(stream: IoStream) -> Self {
        let info = stream.connection_info();
        let (reader, writer) = tokio::io::split(stream);
        Transport::new(reader, writer, info)
    }
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a reader/writer pair
    pub fn new(reader: R, writer: W, info: ConnectionInfo) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            chunk_size: DEFAULT_CHUNK_SIZE,
            info,
        }
    }

    /// Override the read size (at least one byte)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Read up to `chunk_size` bytes.
    ///
    /// An empty result means the peer closed the stream; the transport is
    /// marked closed and every later call returns empty as well.
    pub async fn next_chunk(&self) -> std::io::Result<Bytes> {
        if self.is_closed() {
            return Ok(Bytes::new());
        }

        let mut buf = vec![0u8; self.chunk_size];
        let n = {
            let mut reader = self.reader.lock().await;
            reader.read(&mut buf).await?
        };

        if n == 0 {
            debug!("Peer {} closed the stream", self.peer_label());
            self.close().await;
            return Ok(Bytes::new());
        }

        buf.truncate(n);
        trace!("Read {} bytes from {}", n, self.peer_label());
        Ok(Bytes::from(buf))
    }

    /// Write every chunk of `chunks` in order, then flush once
    pub async fn send<S>(&self, chunks: S) -> std::io::Result<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "transport closed")
        })?;

        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await
    }

    /// Mark closed and release the writer; idempotent
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!("Shutdown of {} failed: {}", self.peer_label(), e);
            }
        }
    }

    /// Whether the transport has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Configured read size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Snapshot of peer, TLS and state information
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::snapshot(&self.info, self.is_closed(), self.chunk_size)
    }

    fn peer_label(&self) -> String {
        self.info
            .peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[async_trait]
impl<R, W> Channel for Transport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&self) -> Option<SessionResult<Bytes>> {
        match self.next_chunk().await {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => Some(Err(e.into())),
        }
    }

    async fn send(&self, frame: Bytes) -> SessionResult<()> {
        Transport::send(self, futures::stream::iter([frame])).await?;
        Ok(())
    }

    async fn close(&self) {
        Transport::close(self).await
    }

    fn is_closed(&self) -> bool {
        Transport::is_closed(self)
    }

    fn diagnostics(&self) -> Diagnostics {
        Transport::diagnostics(self)
    }
}

/// TLS transport layer implementation for secure mesh communication
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::info;

    /// ALPN protocol spoken on mesh connections
    pub const MESH_ALPN: &[u8] = b"mesh/1";

    /// TLS server acceptor wrapper
    #[derive(Clone)]
    pub struct TlsServer {
        acceptor: TlsAcceptor,
    }

    /// TLS client configuration for outbound connections
    #[derive(Clone)]
    pub struct TlsClientConfig {
        /// Rustls client configuration
        pub client_config: Arc<ClientConfig>,
        /// Server name for SNI
        pub server_name: String,
    }

    fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
        let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
        let certs = certs.context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }
        Ok(certs)
    }

    fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
        let keys: Result<Vec<_>, _> =
            rustls_pemfile::pkcs8_private_keys(&mut pem.as_bytes()).collect();
        let mut keys = keys.context("Failed to parse private key")?;
        if keys.is_empty() {
            anyhow::bail!("No private key found");
        }
        Ok(PrivateKeyDer::from(keys.remove(0)))
    }

    fn load_roots(ca_pem: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for ca_cert in load_certs(ca_pem).context("Failed to parse CA certificates")? {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    /// Create a TLS server configuration with mTLS
    pub fn make_server_config(
        cert_chain_pem: &str,
        private_key_pem: &str,
        ca_pem: &str,
    ) -> Result<ServerConfig> {
        info!("Creating TLS server configuration with mTLS");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certs(cert_chain_pem)?;
        let key = load_key(private_key_pem)?;
        let roots = load_roots(ca_pem)?;

        let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("Failed to build client certificate verifier")?;

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)
            .context("Failed to configure server certificate")?;

        config.alpn_protocols = vec![MESH_ALPN.to_vec()];
        Ok(config)
    }

    /// Create a TLS client configuration with mTLS
    pub fn make_client_config(
        cert_chain_pem: &str,
        private_key_pem: &str,
        ca_pem: &str,
    ) -> Result<ClientConfig> {
        info!("Creating TLS client configuration with mTLS");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = load_roots(ca_pem)?;
        let certs = load_certs(cert_chain_pem)?;
        let key = load_key(private_key_pem)?;

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .context("Failed to configure client certificate")?;

        config.alpn_protocols = vec![MESH_ALPN.to_vec()];
        Ok(config)
    }

    /// Create TLS acceptor from server configuration
    pub fn tls_acceptor(config: ServerConfig) -> TlsServer {
        TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Run the server side of a TLS handshake on an accepted socket
    pub async fn accept_tls(acceptor: &TlsServer, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr().ok();
        debug!("Accepting TLS connection from {:?}", peer_addr);

        let tls_stream = acceptor
            .acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {:?}", peer_addr))?;

        Ok(IoStream::Tls(tls_stream))
    }

    /// Run the client side of a TLS handshake on a dialed socket
    pub async fn connect_tls(config: &TlsClientConfig, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr().ok();
        debug!(
            "Connecting via TLS to {:?} (SNI: {})",
            peer_addr, config.server_name
        );

        let connector = TlsConnector::from(config.client_config.clone());
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", config.server_name))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| {
                format!(
                    "TLS handshake failed with {:?} (SNI: {})",
                    peer_addr, config.server_name
                )
            })?;

        Ok(IoStream::TlsClient(tls_stream))
    }
}
