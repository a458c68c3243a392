use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

// -----------------------------------------------------------------------------
// ----- Byte-Pump & Lifecycle (§4.1) -------------------------------------------

/// Mirrors close/flush between a frontend and backend half-duplex pair once
/// both sides are ready. Runs until either peer closes or errors, then closes
/// the other; no buffer is retained across close.
pub async fn link<F, B>(frontend: F, backend: B) -> std::io::Result<(u64, u64)>
where
    F: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut frontend = frontend;
    let mut backend = backend;
    tokio::io::copy_bidirectional(&mut frontend, &mut backend).await
}

/// Writes `sentinel` (may be empty) then shuts the channel down, giving any
/// queued bytes a chance to flush first. Calling this twice on an already
/// shut-down channel is a no-op: `shutdown()` on tokio streams is itself
/// idempotent.
pub async fn close_on_flush<W>(mut channel: W, sentinel: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !sentinel.is_empty() {
        if let Err(e) = channel.write_all(sentinel).await {
            // Best-effort: still attempt the shutdown below.
            let _ = channel.shutdown().await;
            return Err(e);
        }
    }

    channel.shutdown().await
}

/// Closes without attempting a flush.
pub async fn close_quietly<W>(mut channel: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    channel.shutdown().await
}
