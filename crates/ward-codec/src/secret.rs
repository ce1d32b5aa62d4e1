//! Cluster secrets and the keyring that picks one per message.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use ward_core::{AgentConfig, ConfigStore};

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// Cluster name accepted from any sender that knows a valid secret.
pub const JOIN_CLUSTER: &str = "join";

/// Symmetric key material, truncated or zero-padded to [`KEY_LEN`].
#[derive(Clone)]
pub struct ClusterSecret {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ClusterSecret {
    pub fn from_phrase(phrase: &str) -> Self {
        Self::from_bytes(phrase.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        let n = bytes.len().min(KEY_LEN);
        key[..n].copy_from_slice(&bytes[..n]);
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClusterSecret(..)")
    }
}

impl PartialEq for ClusterSecret {
    fn eq(&self, other: &Self) -> bool {
        self.key[..] == other.key[..]
    }
}

/// Source of the local cluster secret phrase, consulted once.
pub type SecretLoader = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// Secrets known to this node: the local cluster secret (loaded lazily,
/// then fixed for the process lifetime) and DR peer cluster secrets.
pub struct Keyring {
    cluster_name: RwLock<String>,
    drp: RwLock<HashMap<String, Arc<ClusterSecret>>>,
    loader: SecretLoader,
    local: OnceLock<Option<Arc<ClusterSecret>>>,
}

impl Keyring {
    pub fn new(cluster_name: &str, loader: SecretLoader) -> Self {
        Self {
            cluster_name: RwLock::new(cluster_name.to_string()),
            drp: RwLock::new(HashMap::new()),
            loader,
            local: OnceLock::new(),
        }
    }

    /// Keyring with a fixed local secret.
    pub fn with_secret(cluster_name: &str, secret: &str) -> Self {
        let phrase = secret.to_string();
        Self::new(cluster_name, Box::new(move || Some(phrase.clone())))
    }

    /// Keyring reading the local secret from the live config on first use.
    pub fn from_store(store: Arc<ConfigStore>) -> Self {
        let config = store.get();
        let keyring = Self::new(
            &config.cluster.name,
            Box::new(move || store.get().cluster.secret.clone()),
        );
        keyring.refresh(&config);
        keyring
    }

    /// Builder method: add a DR peer cluster secret.
    pub fn with_drp(self, cluster_name: &str, secret: &str) -> Self {
        self.drp.write().expect("keyring lock").insert(
            cluster_name.to_string(),
            Arc::new(ClusterSecret::from_phrase(secret)),
        );
        self
    }

    /// Pick up the cluster name and DR peers after a config reload.
    ///
    /// The local secret is not reloaded.
    pub fn refresh(&self, config: &AgentConfig) {
        *self.cluster_name.write().expect("keyring lock") = config.cluster.name.clone();
        let drp: HashMap<String, Arc<ClusterSecret>> = config
            .drp
            .clusters
            .iter()
            .filter_map(|(name, c)| {
                c.secret
                    .as_deref()
                    .map(|s| (name.clone(), Arc::new(ClusterSecret::from_phrase(s))))
            })
            .collect();
        debug!(drp_clusters = drp.len(), "keyring refreshed");
        *self.drp.write().expect("keyring lock") = drp;
    }

    pub fn cluster_name(&self) -> String {
        self.cluster_name.read().expect("keyring lock").clone()
    }

    /// Cluster names whose messages are accepted: local and DR peers.
    pub fn accepted_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        names.insert(self.cluster_name());
        names.extend(self.drp.read().expect("keyring lock").keys().cloned());
        names
    }

    /// The local cluster secret.
    pub fn local_secret(&self) -> Option<Arc<ClusterSecret>> {
        self.local
            .get_or_init(|| match (self.loader)() {
                Some(phrase) if !phrase.is_empty() => {
                    Some(Arc::new(ClusterSecret::from_phrase(&phrase)))
                }
                _ => {
                    warn!("no cluster secret configured");
                    None
                }
            })
            .clone()
    }

    /// Secret for a message addressed with `cluster_name`.
    ///
    /// Precedence: explicit override, then the DR peer secret registered
    /// for that cluster name, then the local secret.
    pub fn resolve(
        &self,
        cluster_name: &str,
        secret_override: Option<&ClusterSecret>,
    ) -> Option<Arc<ClusterSecret>> {
        if let Some(secret) = secret_override {
            return Some(Arc::new(secret.clone()));
        }
        if let Some(secret) = self.drp.read().expect("keyring lock").get(cluster_name) {
            return Some(secret.clone());
        }
        self.local_secret()
    }
}
