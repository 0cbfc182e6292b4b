//! The mesh node: connection registry, outbound buffers, routes and directives.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_control::{DirectiveExecutor, DirectiveRequest};
use mesh_session::{NodeLink, SessionLease};
use mesh_wire::{Envelope, FrameQueue, FramedBuffer, Header, MessageKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{component_debug, component_info};

/// Header attribute carrying a directive name
pub const DIRECTIVE_ATTR: &str = "directive";

/// Header attribute linking a reply to the directive it answers
pub const REPLY_ATTR: &str = "in-reply-to";

/// Header attribute counting the forwards an envelope has left
pub const HOPS_ATTR: &str = "hops";

/// Forwards allowed for an envelope that carries no hop count
pub const MAX_HOPS: u8 = 16;

/// Payload of a ROUTE envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvert {
    /// Advertising node
    pub node: String,
    /// Nodes it currently has sessions with
    pub neighbors: Vec<String>,
}

#[derive(Debug, Clone)]
struct RouteEntry {
    via: String,
    updated: Instant,
}

/// One mesh node
pub struct Node {
    id: String,
    route_ttl: Duration,
    connections: DashMap<String, SessionLease>,
    buffers: DashMap<String, Arc<FrameQueue>>,
    routes: DashMap<String, RouteEntry>,
}

impl Node {
    /// Node `id` whose learned routes live for `route_ttl`
    pub fn new(id: impl Into<String>, route_ttl: Duration) -> Self {
        Self {
            id: id.into(),
            route_ttl,
            connections: DashMap::new(),
            buffers: DashMap::new(),
            routes: DashMap::new(),
        }
    }

    /// Remote ids with a registered session, sorted
    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Neighbor to hand a frame for `recipient` to.
    ///
    /// Direct sessions win, then learned routes; otherwise the frame waits
    /// in the recipient's own buffer until it connects.
    pub fn next_hop(&self, recipient: &str) -> String {
        if self.connections.contains_key(recipient) {
            return recipient.to_string();
        }
        self.routes
            .get(recipient)
            .map(|route| route.via.clone())
            .unwrap_or_else(|| recipient.to_string())
    }

    /// Queue an envelope towards its recipient
    pub fn enqueue(&self, envelope: &Envelope) -> anyhow::Result<String> {
        let recipient = envelope
            .header
            .recipient
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("envelope {:?} has no recipient", envelope.header.kind))?;
        let hop = self.next_hop(recipient);
        self.outbound_buffer(&hop).put(envelope.encode()?);
        trace!("Queued {:?} for {} via {}", envelope.header.kind, recipient, hop);
        Ok(hop)
    }

    /// Answer a directive addressed to this node
    pub fn run_local(&self, directive: &str, _payload: &[u8]) -> anyhow::Result<Bytes> {
        let reply = match directive {
            "ping" => format!("pong from {}", self.id).into_bytes(),
            "status" => serde_json::to_vec_pretty(&self.status())?,
            other => format!("unknown directive: {}", other).into_bytes(),
        };
        Ok(Bytes::from(reply))
    }

    /// Snapshot of connections, routes and queued frames
    pub fn status(&self) -> serde_json::Value {
        let routes: BTreeMap<String, String> = self
            .routes
            .iter()
            .map(|e| (e.key().clone(), e.value().via.clone()))
            .collect();
        let buffered: BTreeMap<String, usize> = self
            .buffers
            .iter()
            .map(|e| (e.key().clone(), e.value().len()))
            .collect();

        serde_json::json!({
            "node_id": self.id,
            "connections": self.connected(),
            "routes": routes,
            "buffered": buffered,
        })
    }

    async fn handle_message(&self, remote_id: &str, envelope: Envelope) {
        match envelope.header.kind {
            MessageKind::Hi => warn!("Ignoring repeated HI from {}", remote_id),
            MessageKind::Route => self.record_routes(remote_id, &envelope),
            MessageKind::Directive if self.is_for_me(&envelope) => {
                self.answer_remote_directive(remote_id, &envelope)
            }
            MessageKind::Data if self.is_for_me(&envelope) => info!(
                "Data from {} ({} bytes)",
                envelope.sender(),
                envelope.payload.len()
            ),
            MessageKind::Directive | MessageKind::Data => self.forward(remote_id, envelope),
        }
    }

    /// Pass a transit envelope on, never back to the peer it came from
    fn forward(&self, remote_id: &str, envelope: Envelope) {
        let Some(recipient) = envelope.header.recipient.clone() else {
            return;
        };
        let hop = self.next_hop(&recipient);
        if hop == remote_id {
            warn!(
                "Dropping {:?} for {} from {}: route leads back to sender",
                envelope.header.kind, recipient, remote_id
            );
            return;
        }

        let hops_left = match envelope.header.attr(HOPS_ATTR) {
            Some(hops) => hops.parse::<u8>().unwrap_or(0),
            None => MAX_HOPS,
        };
        if hops_left == 0 {
            warn!(
                "Dropping {:?} for {} from {}: hop limit reached",
                envelope.header.kind, recipient, remote_id
            );
            return;
        }

        let Envelope { header, payload } = envelope;
        let header = header.with_attr(HOPS_ATTR, (hops_left - 1).to_string());
        let forwarded = Envelope::new(header, payload);
        if let Err(e) = self.enqueue(&forwarded) {
            warn!("Dropping message from {}: {:#}", remote_id, e);
        }
    }

    fn is_for_me(&self, envelope: &Envelope) -> bool {
        envelope
            .header
            .recipient
            .as_deref()
            .map_or(true, |recipient| recipient == self.id)
    }

    fn record_routes(&self, remote_id: &str, envelope: &Envelope) {
        let advert: RouteAdvert = match serde_json::from_slice(&envelope.payload) {
            Ok(advert) => advert,
            Err(e) => {
                warn!("Invalid route advertisement from {}: {}", remote_id, e);
                return;
            }
        };

        let now = Instant::now();
        let mut learned = 0;
        for dest in std::iter::once(&advert.node).chain(advert.neighbors.iter()) {
            if *dest == self.id || dest.as_str() == remote_id {
                continue;
            }
            self.routes.insert(
                dest.clone(),
                RouteEntry {
                    via: remote_id.to_string(),
                    updated: now,
                },
            );
            learned += 1;
        }
        debug!("Learned {} routes via {}", learned, remote_id);
    }

    fn answer_remote_directive(&self, remote_id: &str, envelope: &Envelope) {
        let Some(name) = envelope.header.attr(DIRECTIVE_ATTR) else {
            warn!("Directive from {} without a name", envelope.sender());
            return;
        };

        let reply = match self.run_local(name, &envelope.payload) {
            Ok(reply) => reply,
            Err(e) => Bytes::from(format!("error: {:#}", e)),
        };
        let header = Header::new(self.id.as_str(), MessageKind::Data)
            .with_recipient(envelope.sender())
            .with_attr(REPLY_ATTR, name);
        if let Err(e) = self.enqueue(&Envelope::new(header, reply)) {
            warn!("Could not reply to {} via {}: {:#}", envelope.sender(), remote_id, e);
        }
    }

    /// Drop stale routes and idle buffers of disconnected remotes
    pub fn expire(&self) -> (usize, usize) {
        let ttl = self.route_ttl;
        let mut routes = 0;
        self.routes.retain(|_, route| {
            let fresh = route.updated.elapsed() < ttl;
            routes += usize::from(!fresh);
            fresh
        });

        let mut buffers = 0;
        self.buffers.retain(|id, queue| {
            let keep = !queue.is_empty() || self.connections.contains_key(id);
            buffers += usize::from(!keep);
            keep
        });

        (routes, buffers)
    }

    /// Run [`Node::expire`] every `interval`, forever
    pub async fn watch_expire(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (routes, buffers) = self.expire();
            if routes + buffers > 0 {
                component_debug!(
                    "expiry",
                    "Expired {} routes and {} idle buffers",
                    routes,
                    buffers
                );
            }
        }
    }
}

#[async_trait]
impl NodeLink for Node {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn register(&self, lease: SessionLease) {
        let remote_id = lease.remote_id().to_string();
        let lease_id = lease.id();
        if let Some(previous) = self.connections.insert(remote_id.clone(), lease) {
            if previous.id() != lease_id {
                previous.supersede();
            }
        }
        self.routes.remove(&remote_id);
        component_info!("registry", "Registered {} (lease {})", remote_id, lease_id);
    }

    fn unregister(&self, remote_id: &str, lease_id: u64) {
        if self
            .connections
            .remove_if(remote_id, |_, lease| lease.id() == lease_id)
            .is_some()
        {
            component_info!("registry", "Unregistered {} (lease {})", remote_id, lease_id);
        } else {
            debug!("Ignoring unregister of stale lease {} for {}", lease_id, remote_id);
        }
    }

    fn outbound_buffer(&self, remote_id: &str) -> Arc<FrameQueue> {
        self.buffers
            .entry(remote_id.to_string())
            .or_default()
            .clone()
    }

    async fn advertise_routes(&self) -> anyhow::Result<()> {
        let neighbors = self.connected();
        let payload = serde_json::to_vec(&RouteAdvert {
            node: self.id.clone(),
            neighbors: neighbors.clone(),
        })?;

        for neighbor in &neighbors {
            let header = Header::new(self.id.as_str(), MessageKind::Route).with_recipient(neighbor);
            let frame = Envelope::new(header, payload.clone()).encode()?;
            self.outbound_buffer(neighbor).put(frame);
        }
        debug!("Advertised {} neighbors", neighbors.len());
        Ok(())
    }

    async fn handle_inbound(&self, remote_id: String, inbound: Arc<FramedBuffer>) {
        loop {
            let envelope = inbound.get().await;
            self.handle_message(&remote_id, envelope).await;
        }
    }
}

#[async_trait]
impl DirectiveExecutor for Node {
    async fn execute(
        &self,
        request: DirectiveRequest,
        responder: mpsc::Sender<Bytes>,
    ) -> anyhow::Result<()> {
        let reply = if request.recipient == self.id {
            self.run_local(&request.directive, &request.payload)?
        } else {
            let header = Header::new(self.id.as_str(), MessageKind::Directive)
                .with_recipient(request.recipient.as_str())
                .with_attr(DIRECTIVE_ATTR, request.directive.as_str());
            let hop = self.enqueue(&Envelope::new(header, request.payload))?;
            debug!("Directive {} for {} queued via {}", request.directive, request.recipient, hop);
            Bytes::from(format!("queued for {}", request.recipient))
        };

        responder.send(reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::FrameDecoder;

    fn node(id: &str) -> Arc<Node> {
        Arc::new(Node::new(id, Duration::from_secs(60)))
    }

    fn decode(frame: Bytes) -> Envelope {
        let mut buf = bytes::BytesMut::from(&frame[..]);
        FrameDecoder::new().decode(&mut buf).unwrap().unwrap()
    }

    async fn execute(node: &Node, recipient: &str, directive: &str) -> String {
        let (tx, mut rx) = mpsc::channel(4);
        node.execute(DirectiveRequest::new(recipient, directive, Bytes::new()), tx)
            .await
            .unwrap();
        String::from_utf8(rx.recv().await.unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_latest_registration_supersedes() {
        let node = node("local");
        let (first, _first_rx) = SessionLease::new("peer");
        let (second, _second_rx) = SessionLease::new("peer");

        node.register(first.clone());
        node.register(second.clone());
        assert!(first.is_superseded());
        assert!(!second.is_superseded());

        // A stale unregister leaves the newer session in place
        node.unregister("peer", first.id());
        assert_eq!(node.connected(), vec!["peer".to_string()]);

        node.unregister("peer", second.id());
        assert!(node.connected().is_empty());
    }

    #[test]
    fn test_outbound_buffer_survives_sessions() {
        let node = node("local");
        let queue = node.outbound_buffer("peer");
        queue.put(Bytes::from_static(b"frame"));
        assert!(Arc::ptr_eq(&queue, &node.outbound_buffer("peer")));
    }

    #[tokio::test]
    async fn test_local_directives() {
        let node = node("local");
        assert_eq!(execute(&node, "local", "ping").await, "pong from local");
        assert_eq!(
            execute(&node, "local", "reboot").await,
            "unknown directive: reboot"
        );

        let status: serde_json::Value =
            serde_json::from_str(&execute(&node, "local", "status").await).unwrap();
        assert_eq!(status["node_id"], "local");
        assert!(status["connections"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_directive_is_queued() {
        let node = node("local");
        assert_eq!(execute(&node, "far", "ping").await, "queued for far");

        let frame = node.outbound_buffer("far").try_get().unwrap();
        let envelope = decode(frame);
        assert_eq!(envelope.header.kind, MessageKind::Directive);
        assert_eq!(envelope.header.recipient.as_deref(), Some("far"));
        assert_eq!(envelope.header.attr(DIRECTIVE_ATTR), Some("ping"));
    }

    #[tokio::test]
    async fn test_routes_steer_forwarding() {
        let node = node("local");
        let (lease, _rx) = SessionLease::new("hub");
        node.register(lease);

        let advert = RouteAdvert {
            node: "hub".to_string(),
            neighbors: vec!["local".to_string(), "far".to_string()],
        };
        let header = Header::new("hub", MessageKind::Route).with_recipient("local");
        node.handle_message(
            "hub",
            Envelope::new(header, serde_json::to_vec(&advert).unwrap()),
        )
        .await;

        assert_eq!(node.next_hop("far"), "hub");
        assert_eq!(node.next_hop("hub"), "hub");
        assert_eq!(node.next_hop("unknown"), "unknown");

        execute(&node, "far", "ping").await;
        assert_eq!(node.outbound_buffer("hub").len(), 1);
    }

    async fn learn_far_via_hub(node: &Node) {
        let (lease, _rx) = SessionLease::new("hub");
        node.register(lease);
        let advert = RouteAdvert {
            node: "hub".to_string(),
            neighbors: vec!["far".to_string()],
        };
        let header = Header::new("hub", MessageKind::Route).with_recipient("local");
        node.handle_message(
            "hub",
            Envelope::new(header, serde_json::to_vec(&advert).unwrap()),
        )
        .await;
    }

    #[tokio::test]
    async fn test_transit_frame_not_returned_to_sender() {
        let node = node("local");
        learn_far_via_hub(&node).await;
        assert_eq!(node.next_hop("far"), "hub");

        let header = Header::new("origin", MessageKind::Data).with_recipient("far");
        node.handle_message("hub", Envelope::new(header, b"payload".to_vec()))
            .await;

        assert!(node.outbound_buffer("hub").is_empty());
        assert!(node.outbound_buffer("far").is_empty());
    }

    #[tokio::test]
    async fn test_forwarding_spends_hop_budget() {
        let node = node("local");
        learn_far_via_hub(&node).await;

        let header = Header::new("origin", MessageKind::Data).with_recipient("far");
        node.handle_message("side", Envelope::new(header, b"payload".to_vec()))
            .await;
        let forwarded = decode(node.outbound_buffer("hub").try_get().unwrap());
        assert_eq!(forwarded.header.attr(HOPS_ATTR), Some("15"));
        assert_eq!(forwarded.payload, Bytes::from_static(b"payload"));

        let header = Header::new("origin", MessageKind::Directive)
            .with_recipient("far")
            .with_attr(DIRECTIVE_ATTR, "ping")
            .with_attr(HOPS_ATTR, "0");
        node.handle_message("side", Envelope::new(header, Vec::new()))
            .await;
        assert!(node.outbound_buffer("hub").is_empty());
    }

    #[tokio::test]
    async fn test_directive_from_peer_is_answered() {
        let node = node("local");
        let header = Header::new("origin", MessageKind::Directive)
            .with_recipient("local")
            .with_attr(DIRECTIVE_ATTR, "ping");
        node.handle_message("origin", Envelope::new(header, Vec::new()))
            .await;

        let reply = decode(node.outbound_buffer("origin").try_get().unwrap());
        assert_eq!(reply.header.kind, MessageKind::Data);
        assert_eq!(reply.header.attr(REPLY_ATTR), Some("ping"));
        assert_eq!(reply.payload, Bytes::from_static(b"pong from local"));
    }

    #[tokio::test]
    async fn test_advertise_routes_reaches_every_neighbor() {
        let node = node("local");
        for peer in ["a", "b"] {
            let (lease, _rx) = SessionLease::new(peer);
            node.register(lease);
        }
        node.advertise_routes().await.unwrap();

        for peer in ["a", "b"] {
            let envelope = decode(node.outbound_buffer(peer).try_get().unwrap());
            let advert: RouteAdvert = serde_json::from_slice(&envelope.payload).unwrap();
            assert_eq!(advert.neighbors, vec!["a".to_string(), "b".to_string()]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_drops_stale_state() {
        let node = node("local");
        node.routes.insert(
            "far".to_string(),
            RouteEntry {
                via: "hub".to_string(),
                updated: Instant::now(),
            },
        );
        node.outbound_buffer("gone");
        node.outbound_buffer("waiting")
            .put(Bytes::from_static(b"pending"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(node.expire(), (1, 1));
        assert!(node.routes.is_empty());
        assert_eq!(node.outbound_buffer("waiting").len(), 1);
    }
}
