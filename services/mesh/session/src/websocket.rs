//! WebSocket channel.
//!
//! Each binary WebSocket message is one inbound item. A close frame or the
//! end of the stream marks the channel closed.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::diagnostics::{ConnectionInfo, Diagnostics};
use crate::error::{SessionError, SessionResult};

/// Session channel over an upgraded WebSocket
pub struct WsChannel<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: AtomicBool,
    info: ConnectionInfo,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket
    pub fn new(ws: WebSocketStream<S>, info: ConnectionInfo) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            info,
        }
    }
}

/// Complete the server side of a WebSocket upgrade on an accepted socket
pub async fn accept_ws(stream: TcpStream) -> SessionResult<WsChannel<TcpStream>> {
    let info = ConnectionInfo::plain(stream.peer_addr().ok());
    let ws = tokio_tungstenite::accept_async(stream).await?;
    debug!("WebSocket upgrade accepted from {:?}", info.peer);
    Ok(WsChannel::new(ws, info))
}

/// Dial a WebSocket URL
pub async fn connect_ws(url: &str) -> SessionResult<WsChannel<MaybeTlsStream<TcpStream>>> {
    let (ws, response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SessionError::connect(url, e))?;

    let peer = match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
        _ => None,
    };
    debug!("WebSocket connected to {} (status {})", url, response.status());
    Ok(WsChannel::new(ws, ConnectionInfo::plain(peer)))
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&self) -> Option<SessionResult<Bytes>> {
        if self.is_closed() {
            return None;
        }

        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Some(Ok(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => return Some(Ok(Bytes::from(text.into_bytes()))),
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket close from {:?}: {:?}", self.info.peer, frame);
                    self.closed.store(true, Ordering::SeqCst);
                    return None;
                }
                Some(Ok(other)) => trace!("Ignoring WebSocket control message {:?}", other),
                Some(Err(e)) => return Some(Err(e.into())),
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    async fn send(&self, frame: Bytes) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame.to_vec()))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            trace!("WebSocket close to {:?} failed: {}", self.info.peer, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn diagnostics(&self) -> Diagnostics {
        // WebSocket frames are read whole, not in fixed-size chunks
        Diagnostics::snapshot(&self.info, self.is_closed(), 0)
    }
}
