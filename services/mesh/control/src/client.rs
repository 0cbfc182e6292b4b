//! Directive client used by the `send` command.

use bytes::Bytes;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::protocol::{ControlError, DirectiveRequest};

/// Bytes requested per response read
pub const READ_SIZE: usize = 4096;

/// Payload value that means "read the payload from stdin"
pub const STDIN_PAYLOAD: &str = "-";

/// Send one directive and copy the response to `stdout`.
///
/// Each response chunk is written followed by a newline, until the listener
/// closes the connection.
pub async fn send_directive<I, O>(
    directive: &str,
    recipient: &str,
    payload: &str,
    socket_path: &Path,
    mut stdin: I,
    mut stdout: O,
) -> Result<(), ControlError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let payload = if payload == STDIN_PAYLOAD {
        let mut buf = Vec::new();
        stdin.read_to_end(&mut buf).await?;
        Bytes::from(buf)
    } else {
        Bytes::copy_from_slice(payload.as_bytes())
    };

    let request = DirectiveRequest::new(recipient, directive, payload);
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(&request.encode()).await?;
    debug!(
        socket = %socket_path.display(),
        "Sent {} to {}", directive, recipient
    );

    let mut chunk = vec![0u8; READ_SIZE];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&chunk[..n]).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}
