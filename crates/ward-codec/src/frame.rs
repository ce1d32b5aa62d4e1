//! NUL-terminated framing over byte streams.

use std::io;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::{Decrypted, strip_terminator};
use crate::error::{CodecResult, FrameError};

/// Frame terminator.
pub const TERMINATOR: u8 = 0;

/// Read and write chunk size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Accumulates stream chunks and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, terminator excluded.
    ///
    /// An empty frame is a heartbeat.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == TERMINATOR)?;
        let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
        frame.pop();
        Some(frame)
    }

    /// Bytes held that do not yet form a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Take whatever is buffered, for a peer that closed mid-frame.
    pub fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Read one request message.
///
/// Chunks are accumulated until one ends with the terminator or the peer
/// closes. Returns `None` when the peer closed without sending anything.
/// The terminator, if any, is kept.
pub async fn read_frame<R>(
    reader: &mut R,
    timeout: Duration,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match tokio::time::timeout(timeout, reader.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => return Err(FrameError::Timeout),
        };
        if n == 0 {
            break;
        }
        if message.len() + n > max_bytes {
            return Err(FrameError::TooLarge(max_bytes));
        }
        message.extend_from_slice(&chunk[..n]);
        if chunk[n - 1] == TERMINATOR {
            break;
        }
    }
    Ok((!message.is_empty()).then_some(message))
}

/// Write `data` in [`CHUNK_SIZE`] pieces, then flush.
pub async fn write_chunked<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in data.chunks(CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

/// Peer went away; a normal disconnect, not a fault.
pub fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

// ── Plain frames ───────────────────────────────────────────────

/// Serialize `value` as an unencrypted frame.
pub fn encode_plain<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut out = serde_json::to_vec(value)?;
    out.push(TERMINATOR);
    Ok(out)
}

/// Raw bytes as an unencrypted frame. Embedded NULs are dropped.
pub fn encode_plain_bytes(data: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = data.iter().copied().filter(|b| *b != TERMINATOR).collect();
    out.push(TERMINATOR);
    out
}

/// Parse an unencrypted frame. Cluster and node are left empty.
pub fn decode_plain(raw: &[u8]) -> Decrypted {
    let payload = strip_terminator(raw);
    if payload.is_empty() {
        return Decrypted::Rejected;
    }
    Decrypted::from_payload(String::new(), String::new(), payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn buffer_splits_frames() {
        let mut buf = FrameBuffer::new();
        buf.push(b"abc\0de");
        assert_eq!(buf.next_frame().unwrap(), b"abc");
        assert!(buf.next_frame().is_none());
        assert_eq!(buf.pending(), 2);
        buf.push(b"f\0\0");
        assert_eq!(buf.next_frame().unwrap(), b"def");
        // heartbeat
        assert_eq!(buf.next_frame().unwrap(), b"");
        assert!(buf.next_frame().is_none());
    }

    #[test]
    fn reassembly_independent_of_chunking() {
        let message = encode_plain(&json!({"action": "daemon_status", "pad": "x".repeat(300)})).unwrap();
        for size in [1, 2, 7, 64, message.len()] {
            let mut buf = FrameBuffer::new();
            let mut frames = Vec::new();
            for piece in message.chunks(size) {
                buf.push(piece);
                while let Some(frame) = buf.next_frame() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames.len(), 1, "chunk size {size}");
            assert_eq!(frames[0], &message[..message.len() - 1]);
        }
    }

    #[tokio::test]
    async fn read_frame_across_partial_writes() {
        let message = encode_plain(&json!({"k": "v".repeat(1000)})).unwrap();
        let (mut client, mut server) = tokio::io::duplex(64);
        let sent = message.clone();
        let writer = tokio::spawn(async move {
            for piece in sent.chunks(13) {
                client.write_all(piece).await.unwrap();
            }
            client
        });
        let got = read_frame(&mut server, Duration::from_secs(2), 1 << 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, message);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn read_frame_ends_on_close_without_terminator() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"dequeue_actions").await.unwrap();
        drop(client);
        let got = read_frame(&mut server, Duration::from_secs(2), 1024).await.unwrap();
        assert_eq!(got.unwrap(), b"dequeue_actions");
    }

    #[tokio::test]
    async fn read_frame_none_on_empty_close() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server, Duration::from_secs(1), 1024).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn read_frame_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let err = read_frame(&mut server, Duration::from_secs(6), 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Timeout));
    }

    #[tokio::test]
    async fn read_frame_enforces_limit() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&[b'a'; 2000]).await.unwrap();
        let err = read_frame(&mut server, Duration::from_secs(1), 1000).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(1000)));
    }

    #[tokio::test]
    async fn write_chunked_large_payload() {
        let data = vec![7u8; CHUNK_SIZE * 3 + 11];
        let (mut client, mut server) = tokio::io::duplex(CHUNK_SIZE);
        let expected = data.len();
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            server.read_to_end(&mut out).await.unwrap();
            out.len()
        });
        write_chunked(&mut client, &data).await.unwrap();
        drop(client);
        assert_eq!(reader.await.unwrap(), expected);
    }

    #[test]
    fn plain_roundtrip() {
        let value = json!({"action": "daemon_status", "options": {}});
        let frame = encode_plain(&value).unwrap();
        assert_eq!(decode_plain(&frame).into_value().unwrap(), value);
        assert!(decode_plain(b"\0").is_rejected());
    }

    #[test]
    fn plain_bytes_strip_embedded_nul() {
        assert_eq!(encode_plain_bytes(b"a\0b\n"), b"ab\n\0");
    }

    #[test]
    fn broken_pipe_kinds() {
        assert!(is_broken_pipe(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_broken_pipe(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_broken_pipe(&io::Error::from(io::ErrorKind::TimedOut)));
    }
}
