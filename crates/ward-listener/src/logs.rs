//! Log streaming — backlog then optional follow.

use std::io::SeekFrom;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::encoder::{ReplyEncoder, heartbeat};

/// Largest batch of lines sent in one frame.
pub const MAX_BATCH: usize = 512 * 1024;

/// Idle poll interval in follow mode; one heartbeat per idle poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 64 * 1024;

/// What part of a log to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail {
    /// 0: follow from the end. Negative: whole file. Positive: last N bytes.
    pub backlog: i64,
    pub follow: bool,
}

impl Tail {
    /// Follow mode is implied by a zero backlog.
    pub fn follows(&self) -> bool {
        self.follow || self.backlog == 0
    }
}

/// Offset the stream starts at. When it falls mid-line, skip ahead to the
/// next line start.
pub async fn start_offset(file: &mut File, len: u64, backlog: i64) -> std::io::Result<u64> {
    let offset = match backlog {
        0 => len,
        b if b < 0 => 0,
        b => len.saturating_sub(b as u64),
    };
    if offset == 0 || offset >= len {
        return Ok(offset);
    }

    file.seek(SeekFrom::Start(offset - 1)).await?;
    let mut pos = offset - 1;
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut first = true;
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(len);
        }
        if first && chunk[0] == b'\n' {
            return Ok(offset);
        }
        first = false;
        if let Some(i) = chunk[..n].iter().position(|b| *b == b'\n') {
            return Ok(pos + i as u64 + 1);
        }
        pos += n as u64;
    }
}

/// Send one frame. `false` once the reader is gone.
async fn send(tx: &mpsc::Sender<Bytes>, frame: Option<Bytes>) -> bool {
    match frame {
        Some(frame) => tx.send(frame).await.is_ok(),
        None => false,
    }
}

/// Stream `file` into `tx` according to `tail`.
///
/// Ends at EOF without follow. In follow mode ends only when `stop` is
/// set or the receiver is dropped.
pub async fn stream_log(
    mut file: File,
    tail: Tail,
    encoder: ReplyEncoder,
    tx: mpsc::Sender<Bytes>,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let len = file.metadata().await?.len();
    let follow = tail.follows();
    let mut offset = start_offset(&mut file, len, tail.backlog).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if *stop.borrow() {
            return Ok(());
        }

        let n = file.read(&mut chunk).await?;
        if n > 0 {
            offset += n as u64;
            pending.extend_from_slice(&chunk[..n]);
            while pending.len() > MAX_BATCH {
                let cut = pending[..MAX_BATCH]
                    .iter()
                    .rposition(|b| *b == b'\n')
                    .map_or(MAX_BATCH, |i| i + 1);
                let batch: Vec<u8> = pending.drain(..cut).collect();
                if !send(&tx, encoder.encode_bytes(&batch)).await {
                    return Ok(());
                }
            }
            continue;
        }

        if !follow {
            if !pending.is_empty() {
                send(&tx, encoder.encode_bytes(&pending)).await;
            }
            return Ok(());
        }

        // Follow: hold back a trailing partial line until it completes.
        match pending.iter().rposition(|b| *b == b'\n') {
            Some(i) => {
                let batch: Vec<u8> = pending.drain(..=i).collect();
                if !send(&tx, encoder.encode_bytes(&batch)).await {
                    return Ok(());
                }
            }
            None => {
                if !send(&tx, Some(heartbeat())).await {
                    return Ok(());
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = stop.changed() => return Ok(()),
            _ = tx.closed() => return Ok(()),
        }

        let current = file.metadata().await?.len();
        if current < offset {
            debug!(offset, current, "log truncated, restarting from the top");
            file.seek(SeekFrom::Start(0)).await?;
            offset = 0;
            pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use ward_codec::{Codec, Keyring, decode_plain};
    use ward_core::Ledger;

    fn encoder() -> ReplyEncoder {
        ReplyEncoder::plain(Arc::new(Codec::new(
            "n1",
            Arc::new(Keyring::with_secret("prod", "s")),
            Arc::new(Ledger::new()),
        )))
    }

    fn payload(frame: &[u8]) -> Vec<u8> {
        match decode_plain(frame) {
            ward_codec::Decrypted::Raw { bytes, .. } => bytes,
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn collect(path: &std::path::Path, tail: Tail) -> Vec<u8> {
        let file = File::open(path).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        stream_log(file, tail, encoder(), tx, stop_rx).await.unwrap();
        let mut out = Vec::new();
        while let Some(frame) = rx.recv().await {
            out.extend(payload(&frame));
        }
        out
    }

    fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn tail_returns_complete_lines() {
        let f = write_log(&["first line", "second line", "third"]);
        // "second line\nthird\n" is 18 bytes; ask for 15 to land mid-line.
        let out = collect(f.path(), Tail { backlog: 15, follow: false }).await;
        assert_eq!(out, b"third\n");
    }

    #[tokio::test]
    async fn tail_on_line_boundary_keeps_line() {
        let f = write_log(&["aaa", "bbb", "ccc"]);
        let out = collect(f.path(), Tail { backlog: 8, follow: false }).await;
        assert_eq!(out, b"bbb\nccc\n");
    }

    #[tokio::test]
    async fn negative_backlog_sends_whole_file() {
        let f = write_log(&["one", "two"]);
        let out = collect(f.path(), Tail { backlog: -1, follow: false }).await;
        assert_eq!(out, b"one\ntwo\n");
    }

    #[tokio::test]
    async fn backlog_larger_than_file() {
        let f = write_log(&["one"]);
        let out = collect(f.path(), Tail { backlog: 1000, follow: false }).await;
        assert_eq!(out, b"one\n");
    }

    #[tokio::test]
    async fn large_file_is_batched() {
        let line = "x".repeat(999);
        let lines: Vec<&str> = std::iter::repeat_n(line.as_str(), 1500).collect();
        let f = write_log(&lines);
        let file = File::open(f.path()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(stream_log(file, Tail { backlog: -1, follow: false }, encoder(), tx, stop_rx));
        let mut frames = 0;
        let mut total = 0;
        while let Some(frame) = rx.recv().await {
            let bytes = payload(&frame);
            assert!(bytes.len() <= MAX_BATCH);
            assert_eq!(bytes.last(), Some(&b'\n'));
            total += bytes.len();
            frames += 1;
        }
        task.await.unwrap().unwrap();
        assert_eq!(total, 1500 * 1000);
        assert!(frames >= 3);
    }

    #[tokio::test]
    async fn follow_sends_heartbeats_and_new_lines_until_stopped() {
        let mut f = write_log(&["old"]);
        let file = File::open(f.path()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(stream_log(file, Tail { backlog: 0, follow: false }, encoder(), tx, stop_rx));

        // Nothing new yet: an empty heartbeat frame.
        let first = rx.recv().await.unwrap();
        assert_eq!(&first[..], b"\0");

        writeln!(f, "new line").unwrap();
        f.flush().unwrap();
        let mut got = Vec::new();
        while got.is_empty() {
            let frame = rx.recv().await.unwrap();
            if &frame[..] != b"\0" {
                got = payload(&frame);
            }
        }
        assert_eq!(got, b"new line\n");

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn follow_ends_when_reader_goes_away() {
        let f = write_log(&["old"]);
        let file = File::open(f.path()).await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);
        drop(rx);
        stream_log(file, Tail { backlog: 0, follow: true }, encoder(), tx, stop_rx)
            .await
            .unwrap();
    }
}
