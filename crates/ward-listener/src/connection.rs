//! Connection handler — one request, one reply (or one stream) per
//! accepted raw connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ward_codec::envelope::strip_terminator;
use ward_codec::{Decrypted, FrameError, decode_plain, is_broken_pipe, read_frame, write_chunked};
use ward_core::LOCAL_SENDER;

use crate::context::AgentContext;
use crate::encoder::ReplyEncoder;
use crate::router::{Reply, RequestContext, Router};

/// Literal request body that triggers the action dequeue helper.
pub const DEQUEUE_ACTIONS: &[u8] = b"dequeue_actions";

/// Where a connection came from.
#[derive(Debug, Clone, Copy)]
pub enum Peer {
    /// Local Unix socket: plain frames.
    Local,
    /// TCP: encrypted envelopes.
    Tcp(SocketAddr),
}

impl Peer {
    /// Ledger and blacklist key: the peer IP, without port.
    pub fn sender(&self) -> String {
        match self {
            Peer::Local => LOCAL_SENDER.to_string(),
            Peer::Tcp(addr) => addr.ip().to_string(),
        }
    }

    pub fn encrypted(&self) -> bool {
        matches!(self, Peer::Tcp(_))
    }
}

/// Outcome of decoding one request frame.
pub enum Incoming {
    Request(RequestContext, Value),
    Dequeue,
    Rejected,
}

/// Decode a request frame the same way for every transport.
pub fn decode_request(agent: &Arc<AgentContext>, raw: &[u8], sender: &str, encrypted: bool) -> Incoming {
    if strip_terminator(raw) == DEQUEUE_ACTIONS {
        return Incoming::Dequeue;
    }
    let decoded = if encrypted {
        agent.codec.decrypt(raw, sender)
    } else {
        decode_plain(raw)
    };
    match decoded {
        Decrypted::Structured {
            cluster,
            node,
            value,
        } => {
            agent.ledger.record_validated(sender);
            let encoder = if encrypted {
                ReplyEncoder::sealed(agent.codec.clone(), &cluster)
            } else {
                ReplyEncoder::plain(agent.codec.clone())
            };
            let ctx = RequestContext {
                agent: agent.clone(),
                sender: sender.to_string(),
                nodename: (!node.is_empty()).then_some(node),
                cluster: (!cluster.is_empty()).then_some(cluster),
                encoder,
            };
            Incoming::Request(ctx, value)
        }
        Decrypted::Raw { .. } => {
            debug!(%sender, "request is not a JSON object, dropped");
            Incoming::Rejected
        }
        Decrypted::Rejected => Incoming::Rejected,
    }
}

/// Launch the dequeue helper.
pub fn dequeue_actions(agent: &AgentContext, sender: &str) {
    info!(%sender, "dequeue_actions requested");
    if let Err(e) = agent.helpers.dequeue_actions(&agent.store.get()) {
        warn!(error = %e, "dequeue_actions helper failed to start");
    }
}

/// Serve one raw connection until the reply is written or the stream
/// ends. The socket closes when this returns.
pub async fn serve<S>(agent: Arc<AgentContext>, router: Arc<Router>, mut stream: S, peer: Peer)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let sender = peer.sender();
    handle(&agent, &router, &mut stream, peer, &sender).await;
    agent.ledger.record_closed();
    debug!(%sender, "connection closed");
}

async fn handle<S>(agent: &Arc<AgentContext>, router: &Router, stream: &mut S, peer: Peer, sender: &str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = agent.store.get();
    let raw = match read_frame(stream, config.read_timeout(), config.max_request_bytes()).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            debug!(%sender, "peer closed without a request");
            return;
        }
        Err(FrameError::Timeout) => {
            info!(%sender, timeout = ?config.read_timeout(), "no request before timeout, connection abandoned");
            return;
        }
        Err(FrameError::TooLarge(limit)) => {
            warn!(%sender, limit, "request too large, dropped");
            return;
        }
        Err(FrameError::Io(e)) => {
            debug!(%sender, error = %e, "read failed");
            return;
        }
    };
    agent.ledger.add_rx(sender, raw.len() as u64);

    let (ctx, request) = match decode_request(agent, &raw, sender, peer.encrypted()) {
        Incoming::Request(ctx, request) => (ctx, request),
        Incoming::Dequeue => {
            dequeue_actions(agent, sender);
            return;
        }
        Incoming::Rejected => return,
    };

    match router.dispatch(&ctx, request).await {
        Reply::Json(value) => {
            if let Some(frame) = ctx.encoder.encode(&value) {
                write_frame(agent, stream, &frame, sender).await;
            }
        }
        Reply::Silent => {}
        Reply::Stream(rx) => write_stream(agent, stream, rx, sender).await,
    }
}

/// Write one frame. `false` when the peer is gone.
async fn write_frame<S>(agent: &AgentContext, stream: &mut S, frame: &Bytes, sender: &str) -> bool
where
    S: AsyncWrite + Unpin + Send,
{
    match write_chunked(stream, frame).await {
        Ok(()) => {
            agent.ledger.add_tx(sender, frame.len() as u64);
            true
        }
        Err(e) if is_broken_pipe(&e) => {
            debug!(%sender, "peer disconnected");
            false
        }
        Err(e) => {
            warn!(%sender, error = %e, "write failed");
            false
        }
    }
}

/// Relay stream frames until the producer finishes, the peer leaves or
/// the daemon stops.
async fn write_stream<S>(agent: &AgentContext, stream: &mut S, mut rx: mpsc::Receiver<Bytes>, sender: &str)
where
    S: AsyncWrite + Unpin + Send,
{
    let mut stop = agent.stop.subscribe();
    loop {
        if *stop.borrow_and_update() {
            break;
        }
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if !write_frame(agent, stream, &frame, sender).await {
                        break;
                    }
                }
                None => break,
            },
            _ = stop.changed() => {}
        }
    }
    debug!(%sender, "stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoObjects;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use ward_codec::encode_plain;
    use ward_core::{AgentConfig, ConfigStore};

    fn agent() -> Arc<AgentContext> {
        let mut config = AgentConfig::scaffold("n1", "prod", "s");
        config.listener.read_timeout = Some("200ms".to_string());
        let store = Arc::new(ConfigStore::in_memory(config));
        Arc::new(AgentContext::new(store, Arc::new(NoObjects)).0)
    }

    async fn roundtrip(agent: Arc<AgentContext>, peer: Peer, request: &[u8]) -> Vec<u8> {
        let router = Arc::new(Router::with_builtin_actions());
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(serve(agent, router, server, peer));
        client.write_all(request).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    #[tokio::test]
    async fn plain_request_gets_plain_reply() {
        let agent = agent();
        let req = encode_plain(&json!({"action": "daemon_status", "options": {}})).unwrap();
        let out = roundtrip(agent.clone(), Peer::Local, &req).await;
        let reply = decode_plain(&out).into_value().unwrap();
        assert!(reply.get("cluster").is_some());
        let stats = agent.ledger.stats();
        assert_eq!(stats.clients["local"].validated, 1);
        assert!(stats.clients["local"].tx > 0);
    }

    #[tokio::test]
    async fn encrypted_request_gets_sealed_reply() {
        let agent = agent();
        let peer = Peer::Tcp("10.1.2.3:40000".parse().unwrap());
        let req = agent
            .codec
            .encrypt(&json!({"action": "daemon_running"}), None, None)
            .unwrap();
        let out = roundtrip(agent.clone(), peer, &req).await;
        let reply = agent.codec.decrypt(&out, "test").into_value().unwrap();
        assert_eq!(reply["status"], 0);
        assert_eq!(agent.ledger.stats().clients["10.1.2.3"].validated, 1);
    }

    #[tokio::test]
    async fn plain_request_over_tcp_is_ignored() {
        let agent = agent();
        let peer = Peer::Tcp("10.1.2.3:40000".parse().unwrap());
        let req = encode_plain(&json!({"action": "daemon_status"})).unwrap();
        let out = roundtrip(agent.clone(), peer, &req).await;
        assert!(out.is_empty());
        // Not an envelope: no blacklist penalty.
        assert_eq!(agent.ledger.failures("10.1.2.3"), 0);
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let agent = agent();
        let router = Arc::new(Router::with_builtin_actions());
        let (_client, server) = tokio::io::duplex(64);
        tokio::time::timeout(Duration::from_secs(5), serve(agent, router, server, Peer::Local))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_action_reply() {
        let req = encode_plain(&json!({"action": "bogus"})).unwrap();
        let out = roundtrip(agent(), Peer::Local, &req).await;
        assert_eq!(
            decode_plain(&out).into_value().unwrap(),
            json!({"status": 1, "error": "action not supported"})
        );
    }

    #[test]
    fn peer_sender_is_ip_only() {
        let peer = Peer::Tcp("[fe80::1]:1214".parse().unwrap());
        assert_eq!(peer.sender(), "fe80::1");
        assert!(peer.encrypted());
        assert_eq!(Peer::Local.sender(), "local");
    }
}
