//! One-directional pump
//!
//! Moves whatever bytes are currently available from source to
//! destination, one 32 KiB read at a time, until EOF, error or
//! cancellation. The framing layers below have already done any header
//! work; the pump's contract is ordered, unduplicated delivery plus the
//! per-iteration reset of this direction's ack flags.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::BUFFER_READ_SIZE;
use crate::error::{ProxyError, Result};
use crate::protocol::AckHacks;
use crate::stream::is_cancelled_error;

pub async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    hacks: &AckHacks,
    token: &CancellationToken,
    socket_id: Uuid,
    direction: &'static str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_READ_SIZE];

    loop {
        hacks.reset();

        let n = match src.read(&mut buf).await {
            Ok(0) => {
                debug!(socket_id = %socket_id, direction, "Stream reached EOF");
                let _ = dst.shutdown().await;
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => return Err(map_io(e, token)),
        };

        trace!(socket_id = %socket_id, direction, bytes = n, "Pumping");

        // The framing layers below have already rewritten the headers;
        // consume the flags they raised during this read.
        if hacks.take_quick_ack() {
            trace!(socket_id = %socket_id, direction, "quick ack forwarded");
        }
        if hacks.take_simple_ack() {
            trace!(socket_id = %socket_id, direction, "simple ack delivered");
        }

        if let Err(e) = dst.write_all(&buf[..n]).await {
            return Err(map_io(e, token));
        }
        if let Err(e) = dst.flush().await {
            return Err(map_io(e, token));
        }
    }
}

fn map_io(e: std::io::Error, token: &CancellationToken) -> ProxyError {
    if is_cancelled_error(&e) || token.is_cancelled() {
        ProxyError::Cancelled
    } else {
        ProxyError::Io(e)
    }
}
