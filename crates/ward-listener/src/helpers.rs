//! Helper processes launched on behalf of requests.
//!
//! Asynchronous commands are tracked here and reaped by the listener loop
//! so they never linger as zombies.

use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use ward_core::AgentConfig;

struct Helper {
    label: String,
    child: Child,
}

#[derive(Default)]
pub struct HelperProcesses {
    children: Mutex<Vec<Helper>>,
}

impl HelperProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `argv` detached from any request. Returns the pid.
    pub fn spawn(&self, label: &str, argv: &[String]) -> std::io::Result<Option<u32>> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
        })?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id();
        info!(helper = %label, ?pid, "helper process started");
        self.children.lock().expect("helpers lock").push(Helper {
            label: label.to_string(),
            child,
        });
        Ok(pid)
    }

    /// Run the node command's `dequeue_actions` entry point.
    pub fn dequeue_actions(&self, config: &AgentConfig) -> std::io::Result<Option<u32>> {
        let mut argv = config.commands.node.clone();
        argv.push("dequeue_actions".to_string());
        self.spawn("dequeue_actions", &argv)
    }

    /// Collect exited helpers. Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let mut children = self.children.lock().expect("helpers lock");
        let before = children.len();
        children.retain_mut(|h| match h.child.try_wait() {
            Ok(Some(status)) => {
                debug!(helper = %h.label, %status, "helper process reaped");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(helper = %h.label, error = %e, "helper wait failed");
                false
            }
        });
        before - children.len()
    }

    pub fn count(&self) -> usize {
        self.children.lock().expect("helpers lock").len()
    }
}
