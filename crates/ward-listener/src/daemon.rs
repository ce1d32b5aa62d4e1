//! Listener daemon: binds every transport, accepts connections and runs
//! the housekeeping loop.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use ward_core::{AgentConfig, ConfigStore, EventQueue};
use ward_transport::tls;

use crate::connection::{self, Peer};
use crate::context::{AgentContext, ListenerState, NoObjects, ObjectStatus};
use crate::error::{ListenerError, ListenerResult};
use crate::h2;
use crate::router::Router;

/// Upper bound of one loop iteration's wait.
const TICK: Duration = Duration::from_secs(1);

/// How long in-flight connections get to finish after a stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const BACKLOG: u32 = 1024;

/// An unbound listener daemon.
pub struct Listener {
    ctx: Arc<AgentContext>,
    router: Arc<Router>,
    queue: EventQueue,
}

impl Listener {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self::with_object_status(store, Arc::new(NoObjects))
    }

    /// Listener whose object-scoped actions consult `objects`.
    pub fn with_object_status(store: Arc<ConfigStore>, objects: Arc<dyn ObjectStatus>) -> Self {
        let (ctx, queue) = AgentContext::new(store, objects);
        Self {
            ctx: Arc::new(ctx),
            router: Arc::new(Router::with_builtin_actions()),
            queue,
        }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Register extra actions here before binding.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Bind every configured transport. A transport that fails to bind is
    /// logged and skipped; it is an error only when none could be bound.
    pub fn bind(self) -> ListenerResult<BoundListener> {
        let config = self.ctx.store.get();
        let mut transports = Vec::new();
        let mut socket_files = Vec::new();

        let lsnr = bind_logged("raw-unix", bind_unix(&config.lsnr_sock()));
        if lsnr.is_some() {
            transports.push(format!("raw-unix:{}", config.lsnr_sock().display()));
            socket_files.push(config.lsnr_sock());
        }
        let h2 = bind_logged("h2-unix", bind_unix(&config.h2_sock()));
        if h2.is_some() {
            transports.push(format!("h2-unix:{}", config.h2_sock().display()));
            socket_files.push(config.h2_sock());
        }
        let tcp = bind_logged("raw", bind_tcp(&config.listener_addr(), config.listener_port()));
        if let Some(addr) = tcp.as_ref().and_then(|l| l.local_addr().ok()) {
            transports.push(format!("raw:{addr}"));
        }
        let tls = bind_tls(&config);
        if let Some(addr) = tls.as_ref().and_then(|(l, _)| l.local_addr().ok()) {
            transports.push(format!("https:{addr}"));
        }

        if transports.is_empty() {
            return Err(ListenerError::NoTransport);
        }
        info!(transports = ?transports, node = %self.ctx.nodename(), "listener bound");
        self.ctx.set_transports(transports);

        Ok(BoundListener {
            ctx: self.ctx,
            router: self.router,
            queue: self.queue,
            lsnr,
            h2,
            tcp,
            tls,
            socket_files,
        })
    }
}

fn bind_logged<T>(transport: &'static str, result: io::Result<T>) -> Option<T> {
    match result {
        Ok(t) => Some(t),
        Err(source) => {
            let e = ListenerError::Bind { transport, source };
            error!(error = %e, "transport unavailable");
            None
        }
    }
}

fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

fn bind_tcp(addr: &str, port: u16) -> io::Result<TcpListener> {
    let ip = match addr {
        "" | "*" => IpAddr::from([0u16; 8]),
        a => a
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{addr}: {e}")))?,
    };
    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::new(ip, port))?;
    socket.listen(BACKLOG)
}

fn bind_tls(config: &AgentConfig) -> Option<(TcpListener, TlsAcceptor)> {
    let files = config.listener.tls.as_ref()?;
    let server_config = match tls::server_config(files) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "tls listener disabled");
            return None;
        }
    };
    let listener = bind_logged("https", bind_tcp(&config.tls_addr(), config.tls_port()))?;
    Some((listener, TlsAcceptor::from(server_config)))
}

async fn accept_unix(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(l) => l.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

/// A listener with its transports bound, ready to [`run`](Self::run).
pub struct BoundListener {
    ctx: Arc<AgentContext>,
    router: Arc<Router>,
    queue: EventQueue,
    lsnr: Option<UnixListener>,
    h2: Option<UnixListener>,
    tcp: Option<TcpListener>,
    tls: Option<(TcpListener, TlsAcceptor)>,
    socket_files: Vec<PathBuf>,
}

impl BoundListener {
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    /// Serve until the stop handle fires, then drain.
    pub async fn run(mut self) -> ListenerResult<()> {
        let ctx = self.ctx.clone();
        ctx.set_state(ListenerState::Accepting);
        ctx.components.start_all();
        info!("listener accepting");

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        let mut stop = ctx.stop.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            self.housekeeping(started, &mut tasks);

            tokio::select! {
                accepted = accept_unix(self.lsnr.as_ref()) => match accepted {
                    Ok(stream) => self.spawn_raw(&mut tasks, stream, Peer::Local),
                    Err(e) => warn!(error = %e, "raw-unix accept failed"),
                },
                accepted = accept_unix(self.h2.as_ref()) => match accepted {
                    Ok(stream) => self.spawn_h2(&mut tasks, stream),
                    Err(e) => warn!(error = %e, "h2-unix accept failed"),
                },
                accepted = accept_tcp(self.tcp.as_ref()) => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%addr, error = %e, "set_nodelay failed");
                        }
                        self.spawn_raw(&mut tasks, stream, Peer::Tcp(addr));
                    }
                    Err(e) => warn!(error = %e, "raw accept failed"),
                },
                accepted = accept_tcp(self.tls.as_ref().map(|(l, _)| l)) => match accepted {
                    Ok((stream, addr)) => self.spawn_tls(&mut tasks, stream, addr),
                    Err(e) => warn!(error = %e, "https accept failed"),
                },
                _ = tokio::time::sleep(TICK) => {}
                _ = stop.changed() => {}
            }
        }

        self.drain(tasks).await;
        Ok(())
    }

    fn housekeeping(&mut self, started: Instant, tasks: &mut JoinSet<()>) {
        match self.ctx.store.reload_if_changed() {
            Ok(true) => {
                info!("configuration reloaded");
                self.ctx.codec.keyring().refresh(&self.ctx.store.get());
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "configuration reload failed, keeping previous"),
        }

        self.ctx.helpers.reap();

        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "connection task panicked");
                }
            }
        }

        // Queued events wait out the startup grace period in the queue.
        if started.elapsed() < self.ctx.store.get().event_grace_period() {
            return;
        }
        let events = self.queue.drain();
        if !events.is_empty() {
            self.ctx.broadcaster.fan_out(&events);
        }
    }

    fn spawn_raw<S>(&self, tasks: &mut JoinSet<()>, stream: S, peer: Peer)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let sender = peer.sender();
        self.ctx.ledger.record_accepted(&sender);
        debug!(%sender, "connection accepted");
        tasks.spawn(connection::serve(self.ctx.clone(), self.router.clone(), stream, peer));
    }

    fn spawn_h2(&self, tasks: &mut JoinSet<()>, stream: UnixStream) {
        self.ctx.ledger.record_accepted(ward_core::LOCAL_SENDER);
        tasks.spawn(h2::serve(self.ctx.clone(), self.router.clone(), stream, Peer::Local, true));
    }

    fn spawn_tls(&self, tasks: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        let Some((_, acceptor)) = &self.tls else { return };
        let acceptor = acceptor.clone();
        let peer = Peer::Tcp(addr);
        let ctx = self.ctx.clone();
        let router = self.router.clone();
        ctx.ledger.record_accepted(&peer.sender());
        tasks.spawn(async move {
            let timeout = ctx.store.get().read_timeout();
            match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => {
                    let mutual = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .is_some_and(|certs| !certs.is_empty());
                    debug!(%addr, mutual, "tls session established");
                    h2::serve(ctx, router, stream, peer, mutual).await;
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "tls handshake failed");
                    ctx.ledger.record_closed();
                }
                Err(_) => {
                    debug!(%addr, "tls handshake timed out");
                    ctx.ledger.record_closed();
                }
            }
        });
    }

    async fn drain(mut self, mut tasks: JoinSet<()>) {
        self.ctx.set_state(ListenerState::Draining);
        info!(in_flight = tasks.len(), "listener draining");
        // Stop accepting before waiting on the stragglers.
        self.lsnr.take();
        self.h2.take();
        self.tcp.take();
        self.tls.take();

        let joined = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(remaining = tasks.len(), "drain timeout, aborting connections");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        for path in &self.socket_files {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "socket file not removed");
            }
        }
        self.ctx.set_state(ListenerState::Stopped);
        info!("listener stopped");
    }
}
