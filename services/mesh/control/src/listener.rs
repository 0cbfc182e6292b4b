//! Control socket listener.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{find_delimiter, ControlError, DirectiveRequest, DELIM, MAX_REQUEST_SIZE};

/// Response chunks buffered between an executor and the socket
const RESPONSE_BUFFER: usize = 16;

/// Runs directives received on the control socket
#[async_trait]
pub trait DirectiveExecutor: Send + Sync + 'static {
    /// Execute `request`, streaming response chunks into `responder`.
    ///
    /// The response ends when this returns and `responder` is dropped.
    async fn execute(
        &self,
        request: DirectiveRequest,
        responder: mpsc::Sender<Bytes>,
    ) -> anyhow::Result<()>;
}

/// Accepts directive requests on a filesystem socket
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Bind `path`, replacing a stale socket file, owner-only access
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let path = path.as_ref().to_path_buf();
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        info!(socket = %path.display(), "Opening control socket");

        Ok(Self { listener, path })
    }

    /// Socket file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` turns true, then remove the socket file
    pub async fn run<E: DirectiveExecutor>(
        self,
        executor: Arc<E>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut active: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!("Control listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("Control socket accept failed: {}", e);
                            continue;
                        }
                    };
                    active.retain(|handle| !handle.is_finished());
                    let executor = executor.clone();
                    active.push(tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, executor).await {
                            warn!("Control request failed: {}", e);
                        }
                    }));
                }
            }
        }

        for handle in active {
            handle.abort();
        }
        remove_socket(&self.path);
    }
}

/// Remove the control socket file; missing files are fine
pub fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed control socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), "Failed to remove control socket: {}", e),
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), ControlError> {
    if path.exists() {
        warn!(socket = %path.display(), "Removing stale control socket");
        std::fs::remove_file(path)?;
    }
    Ok(())
}

async fn read_request<R>(stream: &mut R) -> Result<DirectiveRequest, ControlError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    // Bytes before `scanned` cannot start a delimiter
    let mut scanned = 0;
    loop {
        if let Some(offset) = find_delimiter(&buf[scanned..]) {
            return DirectiveRequest::decode(&buf[..scanned + offset]);
        }
        scanned = buf.len().saturating_sub(DELIM.len() - 1);
        if buf.len() > MAX_REQUEST_SIZE + DELIM.len() {
            return Err(ControlError::TooLarge(MAX_REQUEST_SIZE));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ControlError::Incomplete);
        }
    }
}

async fn handle_connection<E: DirectiveExecutor>(
    mut stream: UnixStream,
    executor: Arc<E>,
) -> Result<(), ControlError> {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(ControlError::Io(e)) => return Err(e.into()),
        Err(e) => {
            stream.write_all(format!("error: {}", e).as_bytes()).await?;
            stream.shutdown().await?;
            return Err(e);
        }
    };

    debug!(
        recipient = %request.recipient,
        directive = %request.directive,
        "Dispatching directive ({} byte payload)",
        request.payload.len()
    );

    let (tx, mut rx) = mpsc::channel::<Bytes>(RESPONSE_BUFFER);
    let execution = executor.execute(request, tx);
    let forward = async {
        while let Some(chunk) = rx.recv().await {
            stream.write_all(&chunk).await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let (executed, forwarded) = tokio::join!(execution, forward);
    forwarded?;
    if let Err(e) = executed {
        error!("Directive execution failed: {:#}", e);
        stream.write_all(format!("error: {:#}", e).as_bytes()).await?;
    }

    stream.shutdown().await?;
    Ok(())
}
