//! Core session management for mesh networking.
//!
//! A [`Session`] runs one logical peer connection over any [`Channel`]:
//! HI handshake, registration with the node, and the receive/handle/write
//! task triad. The same state machine serves both roles; only the order of
//! the two handshake halves differs.

use mesh_wire::{FrameQueue, FramedBuffer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::error::{SessionError, SessionResult};
use crate::handshake::{send_hi, wait_hi};
use crate::node::{NodeLink, SessionLease};
use crate::tasks::{TaskKind, TaskSlot};

/// How long the write loop waits on the outbound buffer before re-checking the channel
pub const WRITE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on the wait for the peer's HI
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a mesh session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bound on the wait for the peer's HI
    pub handshake_timeout: Duration,
    /// Bounded wait of the write loop
    pub write_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_poll_interval: WRITE_POLL_INTERVAL,
        }
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the peer; announces first
    Client,
    /// Accepted the peer; learns the peer's id before announcing
    Server,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing started
    Idle,
    /// Receive task running
    Receiving,
    /// Waiting for the peer's HI
    AwaitingHandshake,
    /// Remote id known and registered with the node
    Registered,
    /// Handle and write tasks running
    Running,
    /// Torn down; terminal
    Unregistered,
}

/// One logical peer session
pub struct Session<N: NodeLink> {
    node: Arc<N>,
    config: SessionConfig,
    inbound: Arc<FramedBuffer>,
    state: SessionState,
    remote_id: Option<String>,
    lease: Option<SessionLease>,
    superseded: Option<watch::Receiver<bool>>,
    receive_ended: Option<watch::Receiver<bool>>,
    receive: Option<TaskSlot<()>>,
    handle: Option<TaskSlot<()>>,
    write: Option<TaskSlot<SessionResult<()>>>,
}

impl<N: NodeLink> Session<N> {
    /// Create an idle session with a fresh inbound buffer
    pub fn new(node: Arc<N>, config: SessionConfig) -> Self {
        Self {
            node,
            config,
            inbound: Arc::new(FramedBuffer::new()),
            state: SessionState::Idle,
            remote_id: None,
            lease: None,
            superseded: None,
            receive_ended: None,
            receive: None,
            handle: None,
            write: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Remote id, once the handshake has completed
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// Inbound staging buffer
    pub fn inbound(&self) -> &Arc<FramedBuffer> {
        &self.inbound
    }

    /// Run as the connecting side until the session ends
    pub async fn client<C: Channel>(&mut self, channel: Arc<C>) -> SessionResult<()> {
        self.run(Role::Client, channel).await
    }

    /// Run as the accepting side until the session ends
    pub async fn server<C: Channel>(&mut self, channel: Arc<C>) -> SessionResult<()> {
        self.run(Role::Server, channel).await
    }

    async fn run<C: Channel>(&mut self, role: Role, channel: Arc<C>) -> SessionResult<()> {
        let peer = channel.diagnostics().peer_label();
        info!("Starting {:?} session with {}", role, peer);

        let result = self.drive(role, &channel).await;
        match &result {
            Ok(()) => info!("{:?} session with {} ended normally", role, peer),
            Err(e) => warn!("{:?} session with {} ended: {}", role, peer, e),
        }

        self.unregister(channel.as_ref()).await;
        result
    }

    async fn drive<C: Channel>(&mut self, role: Role, channel: &Arc<C>) -> SessionResult<()> {
        match role {
            Role::Client => {
                send_hi(channel.as_ref(), self.node.node_id()).await?;
                self.start_receiving(channel.clone());
                self.wait_handshake().await?;
            }
            Role::Server => {
                self.start_receiving(channel.clone());
                self.wait_handshake().await?;
                send_hi(channel.as_ref(), self.node.node_id()).await?;
            }
        }
        self.start_processing(channel.clone()).await
    }

    /// Launch the receive task feeding the inbound buffer
    pub fn start_receiving<C: Channel>(&mut self, channel: Arc<C>) {
        debug!("Starting receive task");
        let inbound = self.inbound.clone();
        let (ended_tx, ended_rx) = watch::channel(false);

        self.receive = Some(TaskSlot::spawn(TaskKind::Receive, async move {
            receive(channel, inbound).await;
            ended_tx.send_replace(true);
        }));
        self.receive_ended = Some(ended_rx);
        self.state = SessionState::Receiving;
    }

    async fn wait_handshake(&mut self) -> SessionResult<()> {
        self.state = SessionState::AwaitingHandshake;
        let timeout = self.config.handshake_timeout;
        let ended = self.receive_ended.clone();

        let remote_id = tokio::select! {
            biased;
            hi = wait_hi(&self.inbound, timeout) => hi?,
            _ = receive_finished(ended) => return Err(SessionError::Closed),
        };
        self.register(remote_id)
    }

    fn register(&mut self, remote_id: String) -> SessionResult<()> {
        if let Some(existing) = &self.remote_id {
            return Err(SessionError::Handshake(format!(
                "remote id already set to {}",
                existing
            )));
        }

        let (lease, superseded) = SessionLease::new(remote_id.clone());
        self.remote_id = Some(remote_id.clone());
        self.node.register(lease.clone());
        self.lease = Some(lease);
        self.superseded = Some(superseded);
        self.state = SessionState::Registered;

        info!("Registered session for node {}", remote_id);
        Ok(())
    }

    /// Advertise routes, launch the handle and write tasks, and wait for the write task
    pub async fn start_processing<C: Channel>(&mut self, channel: Arc<C>) -> SessionResult<()> {
        let (remote_id, superseded) = match (&self.remote_id, &self.superseded) {
            (Some(id), Some(rx)) => (id.clone(), rx.clone()),
            _ => {
                return Err(SessionError::Handshake(
                    "processing started before registration".to_string(),
                ))
            }
        };

        debug!("Sending routes");
        if let Err(e) = self.node.advertise_routes().await {
            warn!("Route advertisement failed: {:#}", e);
        }

        debug!("Starting normal loop for {}", remote_id);
        self.state = SessionState::Running;

        let node = self.node.clone();
        let inbound = self.inbound.clone();
        let handler_id = remote_id.clone();
        self.handle = Some(TaskSlot::spawn(TaskKind::Handle, async move {
            node.handle_inbound(handler_id, inbound).await
        }));

        let outbound = self.node.outbound_buffer(&remote_id);
        let poll = self.config.write_poll_interval;
        let write = self.write.insert(TaskSlot::spawn(
            TaskKind::Write,
            watch_queue(channel, outbound, superseded, remote_id, poll),
        ));

        match write.join().await {
            Ok(Some(result)) => result,
            Ok(None) => Ok(()),
            Err(e) => Err(SessionError::Task(e.to_string())),
        }
    }

    /// Tear the session down: leave the registry, cancel running tasks, close the channel.
    ///
    /// Returns the tasks that were still running and got cancelled. Only the
    /// first call does anything.
    pub async fn unregister<C: Channel + ?Sized>(&mut self, channel: &C) -> Vec<TaskKind> {
        if self.state == SessionState::Unregistered {
            return Vec::new();
        }

        if let (Some(remote_id), Some(lease)) = (&self.remote_id, &self.lease) {
            self.node.unregister(remote_id, lease.id());
        }

        let mut cancelled = Vec::new();
        if cancel_slot(&self.receive) {
            cancelled.push(TaskKind::Receive);
        }
        if cancel_slot(&self.handle) {
            cancelled.push(TaskKind::Handle);
        }
        if cancel_slot(&self.write) {
            cancelled.push(TaskKind::Write);
        }

        channel.close().await;
        self.state = SessionState::Unregistered;

        debug!(
            "Unregistered session {:?}, cancelled {:?}",
            self.remote_id, cancelled
        );
        cancelled
    }
}

fn cancel_slot<T: Send + 'static>(slot: &Option<TaskSlot<T>>) -> bool {
    slot.as_ref().map(|s| s.cancel()).unwrap_or(false)
}

async fn receive_finished(ended: Option<watch::Receiver<bool>>) {
    match ended {
        Some(mut rx) => {
            let _ = rx.wait_for(|done| *done).await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn superseded_changed(rx: &mut watch::Receiver<bool>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await
    }
}

/// Pull items off the channel one at a time into the inbound buffer
async fn receive<C: Channel + ?Sized>(channel: Arc<C>, inbound: Arc<FramedBuffer>) {
    loop {
        match channel.recv().await {
            Some(Ok(chunk)) => {
                if let Err(e) = inbound.put(&chunk) {
                    error!("Dropping channel after undecodable input: {}", e);
                    channel.close().await;
                    break;
                }
            }
            Some(Err(e)) => {
                error!("Receive failed: {}", e);
                channel.close().await;
                break;
            }
            None => {
                debug!("Channel ended");
                break;
            }
        }
    }
}

/// Drain the outbound buffer for `remote_id` into the channel.
///
/// A frame that fails to send goes back to the front of the buffer before the
/// channel is closed, so the next session for the remote delivers it.
pub async fn watch_queue<C: Channel + ?Sized>(
    channel: Arc<C>,
    outbound: Arc<FrameQueue>,
    mut superseded: watch::Receiver<bool>,
    remote_id: String,
    poll: Duration,
) -> SessionResult<()> {
    while !channel.is_closed() {
        if *superseded.borrow() {
            info!("Session for {} superseded, closing channel", remote_id);
            channel.close().await;
            return Err(SessionError::Superseded(remote_id));
        }

        let next = tokio::select! {
            frame = outbound.get_timeout(poll) => frame,
            _ = superseded_changed(&mut superseded) => None,
        };
        let Some(frame) = next else { continue };

        trace!("Writing {} bytes to {}", frame.len(), remote_id);
        if let Err(e) = channel.send(frame.clone()).await {
            error!("Write to {} failed: {}", remote_id, e);
            outbound.put_front(frame);
            channel.close().await;
            return Err(e);
        }
    }

    debug!("Channel to {} closed, write loop done", remote_id);
    Ok(())
}
