//! Configuration handling for the mesh node.
//!
//! Settings come from a YAML file, then environment overrides, then command
//! line flags (applied by `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Control socket location when none is configured
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/mesh-node.sock";

/// Mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Identity announced in HI messages
    pub node_id: String,
    /// Mesh listener bind address
    pub listen_address: String,
    /// Mesh listener port
    pub listen_port: u16,
    /// Optional WebSocket listener, e.g. `0.0.0.0:8889`
    pub ws_listen: Option<String>,
    /// Outbound peers as `host:port`
    pub peers: Vec<String>,
    /// Outbound WebSocket peers as `ws://` URLs
    pub ws_peers: Vec<String>,
    /// Control socket path
    pub socket_path: PathBuf,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Delay between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Bound on the wait for a peer's HI
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Period of the route/buffer expiry sweep
    #[serde(with = "humantime_serde")]
    pub expiry_interval: Duration,
    /// Age after which an advertised route is dropped
    #[serde(with = "humantime_serde")]
    pub route_ttl: Duration,
    /// Read size of raw transports
    pub chunk_size: usize,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether mesh connections use mTLS
    pub enabled: bool,
    /// Path to certificate chain (PEM)
    pub cert_file: PathBuf,
    /// Path to private key (PEM)
    pub key_file: PathBuf,
    /// Path to CA certificate (PEM)
    pub ca_file: PathBuf,
    /// SNI for outbound connections; defaults to the peer host
    pub server_name: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8888,
            ws_listen: None,
            peers: Vec::new(),
            ws_peers: Vec::new(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            tls: TlsConfig::default(),
            reconnect_interval: mesh_session::RECONNECT_INTERVAL,
            handshake_timeout: mesh_session::DEFAULT_HANDSHAKE_TIMEOUT,
            expiry_interval: Duration::from_secs(30),
            route_ttl: Duration::from_secs(300),
            chunk_size: mesh_session::DEFAULT_CHUNK_SIZE,
        }
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: MeshConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path))
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final mesh configuration: node_id={}, listen={}:{}, peers={}, socket={:?}, tls={}",
            config.node_id,
            config.listen_address,
            config.listen_port,
            config.peers.len() + config.ws_peers.len(),
            config.socket_path,
            config.tls.enabled
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides from `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(node_id) = lookup("MESH_NODE_ID").filter(|v| !v.trim().is_empty()) {
            info!("Node ID overridden by environment: {}", node_id);
            self.node_id = node_id;
        }

        if let Some(port) = lookup("MESH_LISTEN_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    info!("Listen port overridden by environment: {}", port);
                    self.listen_port = port;
                }
                Err(_) => warn!("Ignoring invalid MESH_LISTEN_PORT {:?}", port),
            }
        }

        if let Some(path) = lookup("MESH_SOCKET_PATH") {
            info!("Control socket overridden by environment: {}", path);
            self.socket_path = PathBuf::from(path);
        }
    }

    /// Mesh listener address as `address:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    /// Outbound peers split into host and port
    pub fn peer_targets(&self) -> Result<Vec<(String, u16)>> {
        self.peers.iter().map(|peer| parse_peer(peer)).collect()
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn parse_peer(peer: &str) -> Result<(String, u16)> {
    let (host, port) = peer
        .rsplit_once(':')
        .with_context(|| format!("Peer {:?} is not host:port", peer))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Peer {:?} has an invalid port", peer))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("Peer {:?} has an empty host", peer);
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(uuid::Uuid::parse_str(&config.node_id).is_ok());
        assert_eq!(config.listen_port, 8888);
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node_id: node-a
listen_port: 9100
peers:
  - 10.0.0.2:9100
  - "[::1]:9200"
ws_peers:
  - ws://10.0.0.3:8889
socket_path: /run/mesh/control.sock
reconnect_interval: 2s
expiry_interval: 1m
tls:
  enabled: true
  cert_file: /etc/mesh/node.pem
  key_file: /etc/mesh/node.key
  ca_file: /etc/mesh/ca.pem
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config: MeshConfig = serde_yaml::from_str(yaml_content).unwrap();
        config.apply_overrides(|_| None);
        let loaded = MeshConfig::load_from_file(temp_file.path()).unwrap();

        for config in [config, loaded] {
            assert_eq!(config.listen_port, 9100);
            assert_eq!(config.reconnect_interval, Duration::from_secs(2));
            assert_eq!(config.expiry_interval, Duration::from_secs(60));
            assert_eq!(config.handshake_timeout, Duration::from_secs(30));
            assert!(config.tls.enabled);
            assert_eq!(config.ws_peers, vec!["ws://10.0.0.3:8889".to_string()]);
            assert_eq!(
                config.peer_targets().unwrap(),
                vec![("10.0.0.2".to_string(), 9100), ("::1".to_string(), 9200)]
            );
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"listen_port: [not, a, port]").unwrap();
        assert!(MeshConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MESH_NODE_ID", "from-env"),
            ("MESH_LISTEN_PORT", "not-a-port"),
            ("MESH_SOCKET_PATH", "/tmp/other.sock"),
        ]);
        let mut config = MeshConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.node_id, "from-env");
        assert_eq!(config.listen_port, 8888);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
    }

    #[test]
    fn test_parse_peer_errors() {
        assert!(parse_peer("no-port").is_err());
        assert!(parse_peer("host:99999").is_err());
        assert!(parse_peer(":9000").is_err());
    }
}
