//! The node as seen by a session.
//!
//! Sessions never reach into global state; everything they need from the
//! node is injected through [`NodeLink`].

use async_trait::async_trait;
use mesh_wire::{FrameQueue, FramedBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Proof of registration handed to the node's connection registry.
///
/// Lease ids grow monotonically, so the registry can tell a stale session's
/// unregister apart from the current one. Superseding a lease ends the write
/// loop of the session that holds it, keeping one writer per outbound buffer.
#[derive(Debug, Clone)]
pub struct SessionLease {
    id: u64,
    remote_id: String,
    superseded: Arc<watch::Sender<bool>>,
}

impl SessionLease {
    /// Create a lease for `remote_id` and the receiver its session watches
    pub fn new(remote_id: impl Into<String>) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let lease = Self {
            id: NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed),
            remote_id: remote_id.into(),
            superseded: Arc::new(tx),
        };
        (lease, rx)
    }

    /// Monotonic lease id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote the lease was issued for
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Tell the holding session that a newer session took over
    pub fn supersede(&self) {
        debug!(
            "Lease {} for {} superseded",
            self.id, self.remote_id
        );
        self.superseded.send_replace(true);
    }

    /// Whether this lease has been superseded
    pub fn is_superseded(&self) -> bool {
        *self.superseded.borrow()
    }
}

/// Capabilities a session needs from its node
#[async_trait]
pub trait NodeLink: Send + Sync + 'static {
    /// This node's id, announced in the HI message
    fn node_id(&self) -> &str;

    /// Record a registered session; the latest lease for an id wins
    fn register(&self, lease: SessionLease);

    /// Forget a session, only if `lease_id` is still the current lease
    fn unregister(&self, remote_id: &str, lease_id: u64);

    /// Outbound queue for a remote, created on first use and kept across sessions
    fn outbound_buffer(&self, remote_id: &str) -> Arc<FrameQueue>;

    /// Send this node's route advertisement to its peers
    async fn advertise_routes(&self) -> anyhow::Result<()>;

    /// Consume envelopes arriving from `remote_id` until cancelled
    async fn handle_inbound(&self, remote_id: String, inbound: Arc<FramedBuffer>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_ids_are_monotonic() {
        let (first, _) = SessionLease::new("node-a");
        let (second, _) = SessionLease::new("node-a");
        assert!(second.id() > first.id());
        assert_eq!(first.remote_id(), "node-a");
    }

    #[test]
    fn test_supersede_reaches_session() {
        let (lease, rx) = SessionLease::new("node-a");
        assert!(!lease.is_superseded());
        assert!(!*rx.borrow());

        lease.clone().supersede();
        assert!(lease.is_superseded());
        assert!(*rx.borrow());
    }
}
