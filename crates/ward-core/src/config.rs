//! node.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Default listener ports, by scheme.
pub const DEFAULT_PORTS: &[(&str, u16)] = &[("raw", 1214), ("https", 1215)];

/// Bind addresses meaning "every interface".
pub const WILDCARD_ADDRS: &[&str] = &["*", "0.0.0.0", "::", ""];

/// Default port for a scheme, from the static table.
pub fn default_port(scheme: &str) -> u16 {
    DEFAULT_PORTS
        .iter()
        .find(|(s, _)| *s == scheme)
        .map(|(_, p)| *p)
        .unwrap_or(1214)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
    #[serde(default)]
    pub arbitrators: BTreeMap<String, PeerConfig>,
    #[serde(default)]
    pub drp: DrpConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    pub context: Option<ContextConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub in_container: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub secret: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            secret: None,
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub tls_addr: Option<String>,
    pub tls_port: Option<u16>,
    pub read_timeout: Option<String>,
    pub max_request_bytes: Option<usize>,
    pub tls: Option<TlsFiles>,
}

/// PEM file locations for the TLS transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Cluster CA. Server side: verifies client certificates (mutual TLS).
    /// Client side: trust root for the server certificate.
    pub ca: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    pub var_dir: Option<PathBuf>,
    pub etc_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub addr: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrpConfig {
    #[serde(default)]
    pub clusters: BTreeMap<String, DrpCluster>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrpCluster {
    pub secret: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsConfig {
    pub grace_period: Option<String>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default)]
    pub node: Vec<String>,
    #[serde(default)]
    pub object: Vec<String>,
}

/// A client context: networking parameters supplied from outside the
/// cluster config, used in place of normal destination resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub name: String,
    pub url: String,
    pub tls: Option<TlsFiles>,
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Minimal config for a single node cluster.
    pub fn scaffold(nodename: &str, cluster: &str, secret: &str) -> Self {
        AgentConfig {
            node: NodeConfig {
                name: Some(nodename.to_string()),
                in_container: false,
            },
            cluster: ClusterConfig {
                name: cluster.to_string(),
                secret: Some(secret.to_string()),
                nodes: vec![nodename.to_string()],
            },
            ..Default::default()
        }
    }

    /// This node's name, defaulting to the system hostname.
    pub fn nodename(&self) -> String {
        self.node.name.clone().unwrap_or_else(system_hostname)
    }

    pub fn var_dir(&self) -> PathBuf {
        self.paths
            .var_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/ward"))
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.paths
            .etc_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/etc/ward"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log/ward"))
    }

    /// Path of the raw (NUL-framed JSON) local socket.
    pub fn lsnr_sock(&self) -> PathBuf {
        self.var_dir().join("lsnr").join("lsnr.sock")
    }

    /// Path of the HTTP/2 local socket.
    pub fn h2_sock(&self) -> PathBuf {
        self.var_dir().join("lsnr").join("h2.sock")
    }

    pub fn listener_addr(&self) -> String {
        self.listener.addr.clone().unwrap_or_else(|| "::".to_string())
    }

    pub fn listener_port(&self) -> u16 {
        self.listener.port.unwrap_or_else(|| default_port("raw"))
    }

    pub fn tls_addr(&self) -> String {
        self.listener
            .tls_addr
            .clone()
            .unwrap_or_else(|| self.listener_addr())
    }

    pub fn tls_port(&self) -> u16 {
        self.listener.tls_port.unwrap_or_else(|| default_port("https"))
    }

    pub fn read_timeout(&self) -> Duration {
        self.listener
            .read_timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(6))
    }

    pub fn max_request_bytes(&self) -> usize {
        self.listener.max_request_bytes.unwrap_or(16 * 1024 * 1024)
    }

    pub fn event_grace_period(&self) -> Duration {
        self.events
            .grace_period
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(2))
    }

    pub fn event_queue_capacity(&self) -> usize {
        self.events.queue_capacity.unwrap_or(1024)
    }

    /// Look up a peer or arbitrator by name.
    pub fn peer(&self, name: &str) -> Option<&PeerConfig> {
        self.peers.get(name).or_else(|| self.arbitrators.get(name))
    }
}

/// Parse "2s", "500ms" or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// The system hostname, short form.
pub fn system_hostname() -> String {
    let full = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    match full.split('.').next() {
        Some(short) if !short.is_empty() => short.to_string(),
        _ => "localhost".to_string(),
    }
}
