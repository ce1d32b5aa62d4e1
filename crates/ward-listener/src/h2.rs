//! HTTP/2 service.
//!
//! Prior-knowledge cleartext on `h2.sock`, ALPN `h2` over TLS on the
//! https port. Each request body carries one raw-protocol frame; the
//! response body carries the reply frame, or the frames of a stream.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::connection::{self, Incoming as Decoded, Peer};
use crate::context::AgentContext;
use crate::router::{Reply, Router};

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

fn status(code: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(Empty::new().boxed_unsync());
    *response.status_mut() = code;
    response
}

/// Serve one HTTP/2 connection. `plain` is set for the local socket and
/// for TLS clients that presented a certificate verified against the
/// cluster CA; everyone else must send encrypted envelopes.
pub async fn serve<S>(agent: Arc<AgentContext>, router: Arc<Router>, io: S, peer: Peer, plain: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let sender = peer.sender();
    let service = {
        let agent = agent.clone();
        let sender = sender.clone();
        service_fn(move |req| handle(agent.clone(), router.clone(), req, sender.clone(), plain))
    };
    let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut stop = agent.stop.subscribe();
    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%sender, error = %e, "h2 connection ended with error");
                }
                break;
            }
            changed = stop.changed(), if !draining => {
                if changed.is_err() || *stop.borrow() {
                    conn.as_mut().graceful_shutdown();
                    draining = true;
                }
            }
        }
    }
    agent.ledger.record_closed();
    debug!(%sender, "h2 connection closed");
}

async fn handle(
    agent: Arc<AgentContext>,
    router: Arc<Router>,
    req: Request<Incoming>,
    sender: String,
    plain: bool,
) -> Result<Response<ResponseBody>, Infallible> {
    let config = agent.store.get();
    let body = Limited::new(req.into_body(), config.max_request_bytes());
    let raw = match tokio::time::timeout(config.read_timeout(), body.collect()).await {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) => {
            warn!(%sender, error = %e, "request body refused");
            return Ok(status(StatusCode::BAD_REQUEST));
        }
        Err(_) => {
            debug!(%sender, "no request body before timeout");
            return Ok(status(StatusCode::REQUEST_TIMEOUT));
        }
    };
    agent.ledger.add_rx(&sender, raw.len() as u64);

    let (ctx, request) = match connection::decode_request(&agent, &raw, &sender, !plain) {
        Decoded::Request(ctx, request) => (ctx, request),
        Decoded::Dequeue => {
            connection::dequeue_actions(&agent, &sender);
            return Ok(status(StatusCode::OK));
        }
        Decoded::Rejected => return Ok(status(StatusCode::BAD_REQUEST)),
    };

    let response = match router.dispatch(&ctx, request).await {
        Reply::Json(value) => match ctx.encoder.encode(&value) {
            Some(frame) => {
                agent.ledger.add_tx(&sender, frame.len() as u64);
                Response::new(Full::new(frame).boxed_unsync())
            }
            None => status(StatusCode::INTERNAL_SERVER_ERROR),
        },
        Reply::Silent => status(StatusCode::OK),
        Reply::Stream(rx) => Response::new(relay(agent.clone(), rx, sender)),
    };
    Ok(response)
}

/// Body fed from a stream reply. The relay ends with the producer, the
/// client, or the daemon.
fn relay(agent: Arc<AgentContext>, mut rx: mpsc::Receiver<Bytes>, sender: String) -> ResponseBody {
    let (tx, body_rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(1);
    tokio::spawn(async move {
        let mut stop = agent.stop.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let len = frame.len() as u64;
                    if tx.send(Ok(Frame::data(frame))).await.is_err() {
                        debug!(%sender, "h2 client went away");
                        break;
                    }
                    agent.ledger.add_tx(&sender, len);
                }
                _ = tx.closed() => break,
                _ = stop.changed() => {}
            }
        }
    });
    StreamBody::new(ReceiverStream::new(body_rx)).boxed_unsync()
}
