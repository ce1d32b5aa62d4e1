//! Destination resolution.
//!
//! Maps a logical destination (empty, a node name, a local socket path or
//! a `scheme://host:port` url) to the concrete transport used to reach it.

use std::fmt;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::debug;

use ward_core::AgentConfig;
use ward_core::config::{TlsFiles, WILDCARD_ADDRS, default_port};

use crate::error::{TransportError, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// NUL-framed JSON over the local Unix socket.
    RawUnix,
    /// Cleartext HTTP/2 over the local Unix socket.
    H2Unix,
    /// NUL-framed envelopes over TCP.
    Raw,
    /// HTTP/2 over TLS.
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::RawUnix => "raw-unix",
            Scheme::H2Unix => "h2-unix",
            Scheme::Raw => "raw",
            Scheme::Https => "https",
        }
    }

    pub fn is_h2(&self) -> bool {
        matches!(self, Scheme::H2Unix | Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unix,
    Inet,
    Inet6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "{}", path.display()),
            Address::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// A resolved transport descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketParams {
    pub scheme: Scheme,
    pub address: Address,
    pub af: AddressFamily,
    /// Payload travels as an encrypted envelope.
    pub encrypted: bool,
    /// Client certificate and trust root for `https`.
    pub tls: Option<TlsFiles>,
    /// Name of the client context that supplied these parameters.
    pub context: Option<String>,
}

impl SocketParams {
    fn unix(scheme: Scheme, path: PathBuf) -> Self {
        Self {
            scheme,
            address: Address::Unix(path),
            af: AddressFamily::Unix,
            encrypted: false,
            tls: None,
            context: None,
        }
    }

    fn tcp(scheme: Scheme, host: String, port: u16, tls: Option<TlsFiles>) -> Self {
        let af = if host.parse::<Ipv6Addr>().is_ok() {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        let encrypted = match scheme {
            Scheme::Https => tls.is_none(),
            _ => true,
        };
        Self {
            scheme,
            address: Address::Tcp { host, port },
            af,
            encrypted,
            tls,
            context: None,
        }
    }

    /// Host part for TCP transports; `None` for Unix sockets.
    pub fn host(&self) -> Option<&str> {
        match &self.address {
            Address::Tcp { host, .. } => Some(host),
            Address::Unix(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "scheme": self.scheme.as_str(),
            "address": self.address.to_string(),
            "af": match self.af {
                AddressFamily::Unix => "unix",
                AddressFamily::Inet => "inet",
                AddressFamily::Inet6 => "inet6",
            },
            "encrypted": self.encrypted,
            "tls": self.tls.is_some(),
            "context": self.context,
        })
    }
}

/// Resolve `dest` against the node configuration.
pub fn resolve(dest: &str, config: &AgentConfig) -> TransportResult<SocketParams> {
    let dest = dest.trim();

    if let Some(ctx) = &config.context {
        let mut params = parse_url(&ctx.url, ctx.tls.clone().or_else(|| config.listener.tls.clone()))?;
        params.context = Some(ctx.name.clone());
        debug!(context = %ctx.name, %dest, "destination resolved through client context");
        return Ok(params);
    }

    if dest.is_empty() || (dest == config.nodename() && !config.node.in_container) {
        return Ok(SocketParams::unix(Scheme::RawUnix, config.lsnr_sock()));
    }

    if dest.starts_with('/') {
        let path = Path::new(dest);
        if path == config.lsnr_sock() {
            return Ok(SocketParams::unix(Scheme::RawUnix, config.lsnr_sock()));
        }
        if path == config.h2_sock() {
            return Ok(SocketParams::unix(Scheme::H2Unix, config.h2_sock()));
        }
        return Err(TransportError::UnknownSocket(path.to_path_buf()));
    }

    if dest.contains("://") {
        return parse_url(dest, config.listener.tls.clone());
    }

    let (host, port) = match config.peer(dest) {
        Some(peer) => {
            let host = match peer.addr.as_deref() {
                Some(addr) if !WILDCARD_ADDRS.contains(&addr) => addr.to_string(),
                _ => dest.to_string(),
            };
            (host, peer.port.unwrap_or_else(|| default_port("raw")))
        }
        None => (dest.to_string(), default_port("raw")),
    };
    Ok(SocketParams::tcp(Scheme::Raw, host, port, None))
}

/// Parse `raw://host[:port]` or `https://host[:port]`.
pub fn parse_url(url: &str, tls: Option<TlsFiles>) -> TransportResult<SocketParams> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidDestination(url.to_string()))?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "raw" => Scheme::Raw,
        "https" => Scheme::Https,
        other => return Err(TransportError::UnsupportedScheme(other.to_string())),
    };
    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = split_host_port(authority)
        .ok_or_else(|| TransportError::InvalidDestination(url.to_string()))?;
    let port = port.unwrap_or_else(|| default_port(scheme.as_str()));
    let tls = match scheme {
        Scheme::Https => tls,
        _ => None,
    };
    Ok(SocketParams::tcp(scheme, host, port, tls))
}

/// Split `host`, `host:port`, `[v6]` or `[v6]:port`.
fn split_host_port(authority: &str) -> Option<(String, Option<u16>)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        // A bare IPv6 literal without brackets carries no port.
        Some((host, _)) if host.contains(':') => Some((authority.to_string(), None)),
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((authority.to_string(), None)),
    }
}
