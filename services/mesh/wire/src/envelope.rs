//! Envelopes exchanged between mesh nodes.
//!
//! An envelope is a CBOR header plus an opaque payload. The session layer only
//! looks at the header's sender `id` (during the HI exchange); everything else
//! belongs to the node's message handler.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::{encode_frame, DEFAULT_MAX_FRAME_SIZE};
use crate::WireError;

/// Envelope kinds understood by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    /// Identity announcement sent during the handshake
    Hi,
    /// Route advertisement
    Route,
    /// Directive forwarded from a control socket
    Directive,
    /// Opaque application data
    Data,
}

/// Envelope header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sender node id
    pub id: String,
    /// Envelope kind
    pub kind: MessageKind,
    /// Final recipient, if addressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Milliseconds since the unix epoch at creation
    pub timestamp: u64,
    /// Free-form string attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl Header {
    /// Create a header stamped with the current time
    pub fn new(id: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            recipient: None,
            timestamp: now_millis(),
            attrs: BTreeMap::new(),
        }
    }

    /// Address the envelope to a recipient
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Attach a string attribute
    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    /// Look up a string attribute
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// A decoded mesh message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Routing and identity header
    pub header: Header,
    /// Opaque payload
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope
    pub fn new(header: Header, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Build the identity announcement for `node_id`
    pub fn hi(node_id: &str) -> Self {
        Self::new(Header::new(node_id, MessageKind::Hi), Bytes::new())
    }

    /// Sender id carried in the header
    pub fn sender(&self) -> &str {
        &self.header.id
    }

    /// Whether this is an identity announcement
    pub fn is_hi(&self) -> bool {
        self.header.kind == MessageKind::Hi
    }

    /// Encode to a single wire frame
    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode_frame(&self.header, &self.payload, DEFAULT_MAX_FRAME_SIZE)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hi_envelope() {
        let hi = Envelope::hi("node-a");
        assert!(hi.is_hi());
        assert_eq!(hi.sender(), "node-a");
        assert!(hi.payload.is_empty());
        assert!(hi.header.timestamp > 0);
    }

    #[test]
    fn test_header_attrs() {
        let header = Header::new("node-a", MessageKind::Directive)
            .with_recipient("node-b")
            .with_attr("directive", "ping");
        assert_eq!(header.recipient.as_deref(), Some("node-b"));
        assert_eq!(header.attr("directive"), Some("ping"));
        assert_eq!(header.attr("missing"), None);
    }
}
