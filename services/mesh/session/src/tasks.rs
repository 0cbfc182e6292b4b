//! Cancellable session tasks.
//!
//! Every task is spawned together with a cancel signal that it observes at
//! its blocking point. Dropping the slot cancels the task as well.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

/// The three tasks a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Channel → inbound buffer
    Receive,
    /// Inbound buffer → node message handler
    Handle,
    /// Outbound buffer → channel
    Write,
}

/// A spawned task and its cancel signal
#[derive(Debug)]
pub struct TaskSlot<T> {
    kind: TaskKind,
    handle: JoinHandle<Option<T>>,
    cancel: watch::Sender<bool>,
}

impl<T: Send + 'static> TaskSlot<T> {
    /// Spawn `fut`; it yields `None` if cancelled before finishing
    pub fn spawn<F>(kind: TaskKind, fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.wait_for(|c| *c) => {
                    debug!("{:?} task cancelled", kind);
                    None
                }
                out = fut => Some(out),
            }
        });
        Self {
            kind,
            handle,
            cancel,
        }
    }

    /// Which task this is
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Whether the task is still running
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal cancellation; returns `false` if the task had already finished
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.cancel.send_replace(true);
        true
    }

    /// Wait for the task to end
    pub async fn join(&mut self) -> Result<Option<T>, JoinError> {
        (&mut self.handle).await
    }
}
