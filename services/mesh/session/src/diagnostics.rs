//! Connection diagnostics captured when a connection is accepted or dialed.

use std::net::SocketAddr;
use tracing::{debug, info};

/// TLS session details of an established connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsContext {
    /// Negotiated protocol version, e.g. `TLSv1_3`
    pub protocol: Option<String>,
    /// Negotiated ALPN protocol
    pub alpn: Option<String>,
    /// Subject of the peer's leaf certificate
    pub peer_subject: Option<String>,
}

/// Static facts about a connection, filled in by whichever transport accepted it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote socket address, when the transport has one
    pub peer: Option<SocketAddr>,
    /// Negotiated compression; rustls never negotiates any
    pub compression: Option<String>,
    /// Negotiated cipher suite
    pub cipher: Option<String>,
    /// Peer leaf certificate (DER)
    pub peer_cert: Option<Vec<u8>>,
    /// TLS session context, absent for plain connections
    pub tls: Option<TlsContext>,
}

impl ConnectionInfo {
    /// Info for a connection without TLS
    pub fn plain(peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            ..Default::default()
        }
    }

    /// Info read from a rustls connection state
    pub fn from_tls(peer: Option<SocketAddr>, state: &rustls::CommonState) -> Self {
        let peer_cert = state
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        let peer_subject = peer_cert.as_deref().and_then(cert_subject);

        Self {
            peer,
            compression: None,
            cipher: state
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            peer_cert,
            tls: Some(TlsContext {
                protocol: state.protocol_version().map(|v| format!("{:?}", v)),
                alpn: state
                    .alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned()),
                peer_subject,
            }),
        }
    }
}

fn cert_subject(der: &[u8]) -> Option<String> {
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => Some(cert.subject().to_string()),
        Err(e) => {
            debug!("Failed to parse peer certificate: {:?}", e);
            None
        }
    }
}

/// Point-in-time snapshot of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Peer IP address
    pub address: Option<String>,
    /// Peer port
    pub port: Option<u16>,
    /// Negotiated compression
    pub compression: Option<String>,
    /// Negotiated cipher suite
    pub cipher: Option<String>,
    /// Peer leaf certificate (DER)
    pub peer_cert: Option<Vec<u8>>,
    /// TLS session context
    pub tls: Option<TlsContext>,
    /// Whether the transport has been closed
    pub closed: bool,
    /// Read size in bytes
    pub chunk_size: usize,
}

impl Diagnostics {
    /// Combine static connection info with the transport's current state
    pub fn snapshot(info: &ConnectionInfo, closed: bool, chunk_size: usize) -> Self {
        Self {
            address: info.peer.map(|p| p.ip().to_string()),
            port: info.peer.map(|p| p.port()),
            compression: info.compression.clone(),
            cipher: info.cipher.clone(),
            peer_cert: info.peer_cert.clone(),
            tls: info.tls.clone(),
            closed,
            chunk_size,
        }
    }

    /// Peer as `address:port`, or `unknown`
    pub fn peer_label(&self) -> String {
        match (&self.address, self.port) {
            (Some(addr), Some(port)) => format!("{}:{}", addr, port),
            (Some(addr), None) => addr.clone(),
            _ => "unknown".to_string(),
        }
    }
}

/// Log the TLS details of a freshly established connection
pub fn log_tls_detail(diag: &Diagnostics) {
    match &diag.tls {
        Some(tls) => info!(
            "TLS connection with {}: protocol={}, cipher={}, alpn={}, peer={}",
            diag.peer_label(),
            tls.protocol.as_deref().unwrap_or("-"),
            diag.cipher.as_deref().unwrap_or("-"),
            tls.alpn.as_deref().unwrap_or("-"),
            tls.peer_subject.as_deref().unwrap_or("-"),
        ),
        None => debug!("Plain connection with {} (no TLS)", diag.peer_label()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_snapshot_has_no_tls_fields() {
        let peer: SocketAddr = "10.0.0.7:9000".parse().unwrap();
        let diag = Diagnostics::snapshot(&ConnectionInfo::plain(Some(peer)), false, 65536);

        assert_eq!(diag.address.as_deref(), Some("10.0.0.7"));
        assert_eq!(diag.port, Some(9000));
        assert_eq!(diag.peer_label(), "10.0.0.7:9000");
        assert!(diag.cipher.is_none());
        assert!(diag.peer_cert.is_none());
        assert!(diag.tls.is_none());
        assert!(!diag.closed);
        assert_eq!(diag.chunk_size, 65536);
    }

    #[test]
    fn test_unknown_peer_label() {
        let diag = Diagnostics::snapshot(&ConnectionInfo::default(), true, 1024);
        assert_eq!(diag.peer_label(), "unknown");
        assert!(diag.closed);
    }

    #[test]
    fn test_bad_certificate_subject() {
        assert!(cert_subject(&[0x30, 0x01]).is_none());
    }
}
