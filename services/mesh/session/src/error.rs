//! Session and transport error types.

use mesh_wire::WireError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by connection establishment and session runs
#[derive(Error, Debug)]
pub enum SessionError {
    /// Could not establish the underlying connection (DNS, refused, TLS handshake)
    #[error("connect to {target} failed: {reason}")]
    Connect {
        /// Address or URL that was dialed
        target: String,
        /// Underlying failure
        reason: String,
    },

    /// Read or write failure on an established channel
    #[error("channel error: {0}")]
    Channel(#[from] std::io::Error),

    /// WebSocket protocol failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame could not be encoded or decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Peer closed the channel
    #[error("channel closed by peer")]
    Closed,

    /// Peer sent something other than a valid identity announcement
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Peer never announced its identity
    #[error("no HI from peer within {0:?}")]
    HandshakeTimeout(Duration),

    /// A newer session registered for the same remote
    #[error("superseded by a newer session for {0}")]
    Superseded(String),

    /// A session task ended abnormally
    #[error("session task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Whether the failure happened before a channel existed
    pub fn is_connect(&self) -> bool {
        matches!(self, SessionError::Connect { .. })
    }

    /// Build a connect error from any displayable failure
    pub fn connect(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SessionError::Connect {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
