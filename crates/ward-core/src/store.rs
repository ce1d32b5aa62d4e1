//! Live configuration with change detection.
//!
//! The listener loop calls [`ConfigStore::reload_if_changed`] once per
//! iteration. Change detection hashes the file content, so a rewrite with
//! identical bytes is not a reload.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::{ConfigError, ConfigResult};

/// Shared, reloadable node configuration.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<AgentConfig>>,
    digest: Mutex<Option<String>>,
}

impl ConfigStore {
    /// Load the config file at `path`.
    pub fn open(path: &Path) -> ConfigResult<Self> {
        let content = read(path)?;
        let config = AgentConfig::from_toml(&content)?;
        info!(path = %path.display(), cluster = %config.cluster.name, "config loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
            digest: Mutex::new(Some(digest(&content))),
        })
    }

    /// Wrap an in-memory config. `reload_if_changed` is a no-op.
    pub fn in_memory(config: AgentConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            digest: Mutex::new(None),
        }
    }

    /// The config file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the current config.
    pub fn get(&self) -> Arc<AgentConfig> {
        self.current.read().expect("config lock").clone()
    }

    /// Re-read the file and swap the config in if its content changed.
    ///
    /// Returns `true` when a new config was installed.
    pub fn reload_if_changed(&self) -> ConfigResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let content = read(path)?;
        let new_digest = digest(&content);
        {
            let known = self.digest.lock().expect("config digest lock");
            if known.as_deref() == Some(new_digest.as_str()) {
                return Ok(false);
            }
        }
        let config = AgentConfig::from_toml(&content)?;
        *self.current.write().expect("config lock") = Arc::new(config);
        *self.digest.lock().expect("config digest lock") = Some(new_digest);
        info!(path = %path.display(), "config reloaded");
        Ok(true)
    }

    /// Apply an in-memory change to the live config.
    ///
    /// Persisting cluster configuration is not this crate's concern, so the
    /// change lives until the next reload from disk.
    pub fn update<F>(&self, f: F) -> Arc<AgentConfig>
    where
        F: FnOnce(&mut AgentConfig),
    {
        let mut guard = self.current.write().expect("config lock");
        let mut next = (**guard).clone();
        f(&mut next);
        let next = Arc::new(next);
        *guard = next.clone();
        debug!("live config updated");
        next
    }
}

fn read(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })
}

fn digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
