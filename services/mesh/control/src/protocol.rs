//! Directive request format spoken over the control socket.
//!
//! A request is `recipient\ndirective\npayload` followed by [`DELIM`]. The
//! payload is opaque and may itself contain newlines. The response is a raw
//! byte stream that ends when the listener closes the connection.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Terminates a request on the control socket
pub const DELIM: &[u8] = b"[{(\x1b)}]";

/// Largest request the listener buffers before giving up
pub const MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;

/// Control socket errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Socket or stdio failure
    #[error("control socket io: {0}")]
    Io(#[from] std::io::Error),

    /// Request could not be split into its three parts
    #[error("malformed directive request: {0}")]
    Malformed(&'static str),

    /// Request grew past the buffering limit without a delimiter
    #[error("directive request exceeds {0} bytes")]
    TooLarge(usize),

    /// Peer closed before sending the delimiter
    #[error("connection closed before the request delimiter")]
    Incomplete,
}

/// One administrative command for a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveRequest {
    /// Node id the directive is addressed to
    pub recipient: String,
    /// Directive name, e.g. `ping`
    pub directive: String,
    /// Opaque argument bytes
    pub payload: Bytes,
}

impl DirectiveRequest {
    /// Request for `directive` on node `recipient`
    pub fn new(
        recipient: impl Into<String>,
        directive: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            directive: directive.into(),
            payload: payload.into(),
        }
    }

    /// Request bytes including the trailing delimiter
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.recipient.len() + self.directive.len() + self.payload.len() + 2 + DELIM.len(),
        );
        buf.put_slice(self.recipient.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(self.directive.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(&self.payload);
        buf.put_slice(DELIM);
        buf.freeze()
    }

    /// Parse a request body, delimiter already stripped
    pub fn decode(body: &[u8]) -> Result<Self, ControlError> {
        let mut parts = body.splitn(3, |b| *b == b'\n');
        let recipient = parts.next().ok_or(ControlError::Malformed("empty request"))?;
        let directive = parts
            .next()
            .ok_or(ControlError::Malformed("missing directive line"))?;
        let payload = parts
            .next()
            .ok_or(ControlError::Malformed("missing payload line"))?;

        let recipient = std::str::from_utf8(recipient)
            .map_err(|_| ControlError::Malformed("recipient is not utf-8"))?
            .trim();
        let directive = std::str::from_utf8(directive)
            .map_err(|_| ControlError::Malformed("directive is not utf-8"))?
            .trim();

        if recipient.is_empty() {
            return Err(ControlError::Malformed("empty recipient"));
        }
        if directive.is_empty() {
            return Err(ControlError::Malformed("empty directive"));
        }

        Ok(Self::new(
            recipient,
            directive,
            Bytes::copy_from_slice(payload),
        ))
    }
}

/// Offset of the first delimiter in `buf`, if any
pub fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIM.len()).position(|w| w == DELIM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let request = DirectiveRequest::new("node1", "ping", Bytes::from_static(b"hello"));
        let mut expected = b"node1\nping\nhello".to_vec();
        expected.extend_from_slice(DELIM);
        assert_eq!(request.encode().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_decode_keeps_payload_newlines() {
        let request = DirectiveRequest::decode(b"node1\nsubmit\nline one\nline two").unwrap();
        assert_eq!(request.recipient, "node1");
        assert_eq!(request.directive, "submit");
        assert_eq!(request.payload, Bytes::from_static(b"line one\nline two"));
    }

    #[test]
    fn test_decode_empty_payload() {
        let request = DirectiveRequest::decode(b"node1\nstatus\n").unwrap();
        assert!(request.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_missing_parts() {
        assert!(matches!(
            DirectiveRequest::decode(b"node1\nping"),
            Err(ControlError::Malformed(_))
        ));
        assert!(matches!(
            DirectiveRequest::decode(b"node1"),
            Err(ControlError::Malformed(_))
        ));
        assert!(matches!(
            DirectiveRequest::decode(b"\nping\n"),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn test_find_delimiter() {
        let encoded = DirectiveRequest::new("a", "b", Bytes::new()).encode();
        assert_eq!(find_delimiter(&encoded), Some(encoded.len() - DELIM.len()));
        assert_eq!(find_delimiter(b"a\nb\nno delimiter"), None);
    }
}
