//! Component registry — named background workers under daemon control.
//!
//! Components (scheduler, heartbeat, monitor, ...) are supplied by the
//! layers above the listener. The registry runs each one in its own task
//! with a private shutdown signal, reports their status, and stops them
//! on request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shutdown order for well-known components. The heartbeat goes after
/// the scheduler so it can announce the final state.
pub const SHUTDOWN_ORDER: &[&str] = &["scheduler", "heartbeat", "monitor"];

const STOP_WAIT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Component-specific status fields.
    fn status(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Run until `shutdown` turns `true`.
    async fn run(&self, shutdown: watch::Receiver<bool>);
}

struct ComponentSlot {
    component: Arc<dyn Component>,
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    started_at: Option<Instant>,
}

impl ComponentSlot {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

#[derive(Default)]
pub struct ComponentRegistry {
    slots: Mutex<BTreeMap<String, ComponentSlot>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component without starting it.
    pub fn register(&self, component: Arc<dyn Component>) {
        let name = component.name().to_string();
        let mut slots = self.slots.lock().expect("components lock");
        if let Some(old) = slots.insert(
            name.clone(),
            ComponentSlot {
                component,
                handle: None,
                shutdown_tx: None,
                started_at: None,
            },
        ) {
            if let Some(tx) = old.shutdown_tx {
                let _ = tx.send(true);
            }
        }
        debug!(component = %name, "component registered");
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.lock().expect("components lock").keys().cloned().collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.slots
            .lock()
            .expect("components lock")
            .get(name)
            .is_some_and(ComponentSlot::is_running)
    }

    /// Start a registered component. Starting a running one is a no-op.
    pub fn start(&self, name: &str) -> Result<(), String> {
        let mut slots = self.slots.lock().expect("components lock");
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| format!("unknown component {name}"))?;
        if slot.is_running() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let component = slot.component.clone();
        slot.handle = Some(tokio::spawn(async move {
            component.run(shutdown_rx).await;
        }));
        slot.shutdown_tx = Some(shutdown_tx);
        slot.started_at = Some(Instant::now());
        info!(component = %name, "component started");
        Ok(())
    }

    pub fn start_all(&self) {
        for name in self.names() {
            if let Err(e) = self.start(&name) {
                warn!(component = %name, error = %e, "component start failed");
            }
        }
    }

    /// Signal a component to stop. With `wait`, join it (bounded).
    pub async fn stop(&self, name: &str, wait: bool) -> Result<(), String> {
        let handle = {
            let mut slots = self.slots.lock().expect("components lock");
            let slot = slots
                .get_mut(name)
                .ok_or_else(|| format!("unknown component {name}"))?;
            if let Some(tx) = slot.shutdown_tx.take() {
                let _ = tx.send(true);
            }
            slot.started_at = None;
            slot.handle.take()
        };
        info!(component = %name, wait, "component stop requested");
        if let (true, Some(mut handle)) = (wait, handle) {
            if tokio::time::timeout(STOP_WAIT, &mut handle).await.is_err() {
                warn!(component = %name, "component did not stop in time, aborted");
                handle.abort();
            }
        }
        Ok(())
    }

    /// Stop every component: well-known ones first, in order, then the rest.
    pub async fn shutdown_ordered(&self) {
        let names = self.names();
        let ordered = SHUTDOWN_ORDER
            .iter()
            .map(|s| s.to_string())
            .filter(|n| names.contains(n))
            .chain(names.iter().filter(|n| !SHUTDOWN_ORDER.contains(&n.as_str())).cloned());
        for name in ordered.collect::<Vec<_>>() {
            let _ = self.stop(&name, true).await;
        }
        info!("all components stopped");
    }

    /// Status of every component, keyed by name.
    pub fn status(&self) -> Value {
        let slots = self.slots.lock().expect("components lock");
        let map: Map<String, Value> = slots
            .iter()
            .map(|(name, slot)| {
                let mut entry = match slot.component.status() {
                    Value::Object(m) => m,
                    other => {
                        let mut m = Map::new();
                        m.insert("detail".to_string(), other);
                        m
                    }
                };
                let state = if slot.is_running() { "running" } else { "stopped" };
                entry.insert("state".to_string(), json!(state));
                if let Some(at) = slot.started_at {
                    entry.insert("uptime".to_string(), json!(at.elapsed().as_secs()));
                }
                (name.clone(), Value::Object(entry))
            })
            .collect();
        Value::Object(map)
    }
}
