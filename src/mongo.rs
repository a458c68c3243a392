//! Minimal MongoDB engine ([EXPANDED] per SPEC_FULL.md "Supplemented
//! surface"). Pure length-framed byte passthrough: the only wire knowledge
//! is the 4-byte little-endian `messageLength` prefix every MongoDB wire
//! message opens with. Each whole message is hex-logged and forwarded
//! unchanged; nothing is parsed, inspected, or audited beyond that, per the
//! Non-goal on the Mongo engine itself.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{instrument, trace, warn};

use crate::config::routes::MongoRouteEntry;
use crate::util::hex_encode;

const HEADER_LEN: usize = 4;
/// MongoDB's documented `maxMessageSizeBytes` default.
const MAX_MESSAGE_LEN: usize = 48 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

pub struct MongoConnection {
    stream: TcpStream,
    peer: String,
    route: MongoRouteEntry,
}

impl MongoConnection {
    pub fn new(stream: TcpStream, peer: String, route: MongoRouteEntry) -> Self {
        Self { stream, peer, route }
    }

    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn serve(mut self) -> std::io::Result<()> {
        let mut backend = match TcpStream::connect((self.route.host.as_str(), self.route.port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "mongo backend dial failed");
                let _ = self.stream.shutdown().await;
                return Ok(());
            }
        };

        let (mut client_read, mut client_write) = self.stream.split();
        let (mut backend_read, mut backend_write) = backend.split();

        tokio::select! {
            res = pump_logged(&mut client_read, &mut backend_write, "client->backend") => {
                if let Err(e) = res { warn!(error = %e, "mongo client->backend pump ended"); }
            }
            res = pump_logged(&mut backend_read, &mut client_write, "backend->client") => {
                if let Err(e) = res { warn!(error = %e, "mongo backend->client pump ended"); }
            }
        }

        Ok(())
    }
}

/// Reads whole length-framed messages from `src`, hex-logs each one, and
/// forwards the raw bytes to `dst` unchanged.
async fn pump_logged<R, W>(src: &mut R, dst: &mut W, direction: &'static str) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut inbox = BytesMut::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = src.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        inbox.extend_from_slice(&chunk[..n]);

        while let Some(frame) = split_message(&mut inbox)? {
            trace!(direction, bytes = frame.len(), hex = %hex_encode(&frame), "mongo message");
            dst.write_all(&frame).await?;
        }
    }
}

fn split_message(buf: &mut BytesMut) -> std::io::Result<Option<BytesMut>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < HEADER_LEN || len > MAX_MESSAGE_LEN {
        return Err(std::io::Error::other(format!("invalid mongo messageLength {len}")));
    }
    if buf.len() < len {
        return Ok(None);
    }
    Ok(Some(buf.split_to(len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn message(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le((HEADER_LEN + payload.len()) as u32);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn splits_one_whole_message() {
        let mut buf = message(b"hello");
        let frame = split_message(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &message(b"hello")[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_full_message() {
        let full = message(b"hello world");
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert_eq!(split_message(&mut partial).unwrap(), None);
    }

    #[test]
    fn rejects_absurd_length() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        assert!(split_message(&mut buf).is_err());
    }
}
