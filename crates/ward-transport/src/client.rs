//! Requester — the client side of the listener protocol.
//!
//! Resolves a destination, connects over the matching transport, sends
//! one framed request and reads back the reply (or a stream of frames).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use ward_codec::{ClusterSecret, Codec, Decrypted, FrameBuffer, decode_plain, encode_plain, write_chunked};
use ward_core::ConfigStore;

use crate::error::{TransportError, TransportResult};
use crate::resolver::{Address, Scheme, SocketParams, resolve};
use crate::tls;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Per-request envelope overrides.
#[derive(Debug, Clone, Default)]
pub struct Seal {
    /// Envelope cluster name, such as `join`.
    pub cluster_name: Option<String>,
    pub secret: Option<ClusterSecret>,
}

impl Seal {
    pub fn cluster(name: &str) -> Self {
        Self {
            cluster_name: Some(name.to_string()),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: ClusterSecret) -> Self {
        self.secret = Some(secret);
        self
    }
}

/// One item read from a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Empty frame: the peer is alive but has nothing to send.
    Heartbeat,
    Message(Decrypted),
}

/// Sends requests to local and remote listeners.
#[derive(Clone)]
pub struct Requester {
    store: Arc<ConfigStore>,
    codec: Arc<Codec>,
    timeout: Duration,
}

impl Requester {
    pub fn new(store: Arc<ConfigStore>, codec: Arc<Codec>) -> Self {
        Self {
            store,
            codec,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builder method: bound the wait for a single reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resolve(&self, dest: &str) -> TransportResult<SocketParams> {
        resolve(dest, &self.store.get())
    }

    /// Send `request` to `dest` and return the JSON reply.
    pub async fn request(&self, dest: &str, request: &Value) -> TransportResult<Value> {
        let params = self.resolve(dest)?;
        self.request_to(&params, request, &Seal::default()).await
    }

    /// Send `request` over resolved transport parameters.
    pub async fn request_to(
        &self,
        params: &SocketParams,
        request: &Value,
        seal: &Seal,
    ) -> TransportResult<Value> {
        match tokio::time::timeout(self.timeout, self.exchange(params, request, seal)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }

    async fn exchange(
        &self,
        params: &SocketParams,
        request: &Value,
        seal: &Seal,
    ) -> TransportResult<Value> {
        let mut stream = self.open_to(params, request, seal).await?;
        match stream.next_message().await? {
            Some(Decrypted::Structured { value, .. }) => Ok(value),
            Some(Decrypted::Raw { bytes, .. }) => {
                Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Some(Decrypted::Rejected) => Err(TransportError::Rejected),
            None => Err(TransportError::Closed),
        }
    }

    /// Send `request` to `dest` and return the response stream, for log
    /// following and event subscriptions.
    pub async fn open(&self, dest: &str, request: &Value) -> TransportResult<ResponseStream> {
        let params = self.resolve(dest)?;
        self.open_to(&params, request, &Seal::default()).await
    }

    pub async fn open_to(
        &self,
        params: &SocketParams,
        request: &Value,
        seal: &Seal,
    ) -> TransportResult<ResponseStream> {
        let frame = if params.encrypted {
            self.codec
                .encrypt(request, seal.cluster_name.as_deref(), seal.secret.as_ref())?
        } else {
            encode_plain(request)?
        };
        debug!(
            scheme = %params.scheme,
            address = %params.address,
            encrypted = params.encrypted,
            bytes = frame.len(),
            "sending request"
        );

        let body = match params.scheme {
            Scheme::RawUnix | Scheme::Raw => {
                let mut io = connect_raw(params).await?;
                write_chunked(&mut io, &frame).await?;
                Body::Raw(io)
            }
            Scheme::H2Unix | Scheme::Https => Body::H2(send_h2(params, frame).await?),
        };

        Ok(ResponseStream {
            body,
            buf: FrameBuffer::new(),
            done: false,
            decoder: Decoder {
                codec: self.codec.clone(),
                encrypted: params.encrypted,
                sender: params.host().unwrap_or("local").to_string(),
                seal: seal.clone(),
            },
        })
    }
}

async fn connect_raw(params: &SocketParams) -> TransportResult<Box<dyn Io>> {
    match &params.address {
        Address::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        Address::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}

async fn send_h2(params: &SocketParams, frame: Vec<u8>) -> TransportResult<Incoming> {
    let (io, uri): (Box<dyn Io>, String) = match &params.address {
        Address::Unix(path) => (
            Box::new(UnixStream::connect(path).await?) as Box<dyn Io>,
            "http://localhost/".to_string(),
        ),
        Address::Tcp { host, port } => {
            let tcp = TcpStream::connect((host.as_str(), *port)).await?;
            tcp.set_nodelay(true)?;
            let config = tls::client_config(params.tls.as_ref())?;
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| TransportError::Tls(format!("invalid server name '{host}': {e}")))?;
            let stream = tokio_rustls::TlsConnector::from(config)
                .connect(server_name, tcp)
                .await?;
            (Box::new(stream) as Box<dyn Io>, format!("https://{}/", params.address))
        }
    };

    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "h2 client connection ended");
        }
    });

    let request = http::Request::post(uri)
        .body(Full::new(Bytes::from(frame)))
        .map_err(|e| TransportError::Http(e.to_string()))?;
    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        warn!(status = %response.status(), "request refused by listener");
        return Err(TransportError::Rejected);
    }
    Ok(response.into_body())
}

enum Body {
    Raw(Box<dyn Io>),
    H2(Incoming),
}

struct Decoder {
    codec: Arc<Codec>,
    encrypted: bool,
    sender: String,
    seal: Seal,
}

impl Decoder {
    fn decode(&self, frame: &[u8]) -> Decrypted {
        if !self.encrypted {
            return decode_plain(frame);
        }
        let mut accepted = self.codec.keyring().accepted_names();
        if let Some(name) = &self.seal.cluster_name {
            accepted.insert(name.clone());
        }
        self.codec
            .decrypt_with(frame, &accepted, self.seal.secret.as_ref(), &self.sender)
    }
}

/// Frames read back from a listener.
pub struct ResponseStream {
    body: Body,
    buf: FrameBuffer,
    done: bool,
    decoder: Decoder,
}

impl ResponseStream {
    /// Next item, or `None` once the listener closed the stream.
    pub async fn next(&mut self) -> TransportResult<Option<StreamItem>> {
        loop {
            if let Some(frame) = self.buf.next_frame() {
                if frame.is_empty() {
                    return Ok(Some(StreamItem::Heartbeat));
                }
                return Ok(Some(StreamItem::Message(self.decoder.decode(&frame))));
            }
            if self.done {
                // A peer may close without terminating its last frame.
                let rest = self.buf.take_rest();
                if rest.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(StreamItem::Message(self.decoder.decode(&rest))));
            }
            match &mut self.body {
                Body::Raw(io) => {
                    let mut chunk = vec![0u8; ward_codec::frame::CHUNK_SIZE];
                    let n = io.read(&mut chunk).await?;
                    if n == 0 {
                        self.done = true;
                    } else {
                        self.buf.push(&chunk[..n]);
                    }
                }
                Body::H2(body) => match body.frame().await {
                    Some(frame) => {
                        if let Ok(data) = frame?.into_data() {
                            self.buf.push(&data);
                        }
                    }
                    None => self.done = true,
                },
            }
        }
    }

    /// Next message, skipping heartbeats.
    pub async fn next_message(&mut self) -> TransportResult<Option<Decrypted>> {
        loop {
            match self.next().await? {
                Some(StreamItem::Heartbeat) => continue,
                Some(StreamItem::Message(msg)) => return Ok(Some(msg)),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;
    use ward_codec::{Keyring, read_frame};
    use ward_core::{AgentConfig, Ledger};

    fn requester(var_dir: &std::path::Path) -> Requester {
        let mut config = AgentConfig::scaffold("n1", "prod", "secret");
        config.paths.var_dir = Some(var_dir.to_path_buf());
        let store = Arc::new(ConfigStore::in_memory(config));
        let codec = Arc::new(Codec::new(
            "n1",
            Arc::new(Keyring::from_store(store.clone())),
            Arc::new(Ledger::new()),
        ));
        Requester::new(store, codec).with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn unix_request_reply() {
        let dir = tempfile::tempdir().unwrap();
        let req = requester(dir.path());
        let path = req.resolve("").unwrap();
        let Address::Unix(sock) = &path.address else {
            panic!("expected unix address");
        };
        std::fs::create_dir_all(sock.parent().unwrap()).unwrap();
        let listener = UnixListener::bind(sock).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream, Duration::from_secs(2), 1 << 20)
                .await
                .unwrap()
                .unwrap();
            let request = decode_plain(&frame).into_value().unwrap();
            assert_eq!(request["action"], "daemon_running");
            // heartbeat first, then the reply
            stream.write_all(b"\0").await.unwrap();
            stream
                .write_all(&encode_plain(&json!({"status": 0})).unwrap())
                .await
                .unwrap();
        });

        let reply = req.request("", &json!({"action": "daemon_running"})).await.unwrap();
        assert_eq!(reply, json!({"status": 0}));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_without_reply() {
        let dir = tempfile::tempdir().unwrap();
        let req = requester(dir.path());
        let sock = dir.path().join("lsnr").join("lsnr.sock");
        std::fs::create_dir_all(sock.parent().unwrap()).unwrap();
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let err = req.request("", &json!({"action": "x"})).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed | TransportError::Io(_)));
    }

    #[tokio::test]
    async fn connect_refused_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = requester(dir.path());
        let err = req.request("", &json!({"action": "x"})).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
