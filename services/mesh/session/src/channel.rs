//! Uniform bidirectional channel that sessions run over.
//!
//! Raw TCP/TLS transports and WebSockets both implement [`Channel`], so the
//! session state machine is written once for both.

use async_trait::async_trait;
use bytes::Bytes;

use crate::diagnostics::Diagnostics;
use crate::error::SessionResult;

/// A connection as seen by a session
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Next inbound item; `None` once the peer has ended the stream
    async fn recv(&self) -> Option<SessionResult<Bytes>>;

    /// Send one encoded frame
    async fn send(&self, frame: Bytes) -> SessionResult<()>;

    /// Close the channel; calling it again is a no-op
    async fn close(&self);

    /// Whether the channel has been closed by either side
    fn is_closed(&self) -> bool;

    /// Diagnostics snapshot
    fn diagnostics(&self) -> Diagnostics;
}
