//! HI handshake for mesh sessions.
//!
//! Each side announces its node id in a HI envelope. A client announces first;
//! a server waits for the client's HI before announcing itself.

use mesh_wire::{Envelope, FramedBuffer};
use std::time::Duration;
use tracing::debug;

use crate::channel::Channel;
use crate::error::{SessionError, SessionResult};

/// Send this node's identity announcement
pub async fn send_hi<C: Channel + ?Sized>(channel: &C, node_id: &str) -> SessionResult<()> {
    let frame = Envelope::hi(node_id).encode()?;
    channel.send(frame).await?;
    debug!("Sent HI from node {}", node_id);
    Ok(())
}

/// Extract the announced id from the first envelope of a session
pub fn parse_hi(envelope: &Envelope) -> SessionResult<String> {
    if !envelope.is_hi() {
        return Err(SessionError::Handshake(format!(
            "expected HI, got {:?} from {:?}",
            envelope.header.kind, envelope.header.id
        )));
    }

    let id = envelope.sender().trim();
    if id.is_empty() {
        return Err(SessionError::Handshake("HI without sender id".to_string()));
    }
    Ok(id.to_string())
}

/// Wait for the peer's HI on the inbound buffer
pub async fn wait_hi(inbound: &FramedBuffer, timeout: Duration) -> SessionResult<String> {
    debug!("Waiting for HI");
    let envelope = inbound
        .get_timeout(timeout)
        .await
        .ok_or(SessionError::HandshakeTimeout(timeout))?;
    parse_hi(&envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::{Header, MessageKind};

    #[test]
    fn test_parse_hi() {
        assert_eq!(parse_hi(&Envelope::hi("node-a")).unwrap(), "node-a");
    }

    #[test]
    fn test_parse_rejects_other_kinds() {
        let data = Envelope::new(Header::new("node-a", MessageKind::Data), Vec::new());
        assert!(matches!(parse_hi(&data), Err(SessionError::Handshake(_))));
    }

    #[test]
    fn test_parse_rejects_blank_id() {
        assert!(matches!(
            parse_hi(&Envelope::hi("  ")),
            Err(SessionError::Handshake(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_hi_times_out() {
        let inbound = FramedBuffer::new();
        let result = wait_hi(&inbound, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(SessionError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn test_wait_hi_reads_buffered_hi() {
        let inbound = FramedBuffer::new();
        inbound
            .put(&Envelope::hi("node-b").encode().unwrap())
            .unwrap();
        assert_eq!(
            wait_hi(&inbound, Duration::from_secs(1)).await.unwrap(),
            "node-b"
        );
    }
}
