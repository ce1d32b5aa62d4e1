//! Shared daemon state handed to every connection and handler.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::info;

use ward_codec::{Codec, Keyring};
use ward_core::{ConfigStore, EventPublisher, EventQueue, Ledger};
use ward_transport::Requester;

use crate::components::ComponentRegistry;
use crate::events::Broadcaster;
use crate::helpers::HelperProcesses;

/// Process-wide stop flag.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask every loop to wind down.
    pub fn signal(&self) {
        if !self.tx.send_replace(true) {
            info!("stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the flag is set.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            // The sender lives as long as this handle.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Binding,
    Accepting,
    Draining,
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Binding => "binding",
            ListenerState::Accepting => "accepting",
            ListenerState::Draining => "draining",
            ListenerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle queries answered by the object layer.
pub trait ObjectStatus: Send + Sync {
    /// The object at `path` is being deleted.
    fn is_deleting(&self, path: &str) -> bool;
}

/// No objects known: nothing is ever being deleted.
pub struct NoObjects;

impl ObjectStatus for NoObjects {
    fn is_deleting(&self, _path: &str) -> bool {
        false
    }
}

/// Everything a handler may touch.
pub struct AgentContext {
    pub store: Arc<ConfigStore>,
    pub ledger: Arc<Ledger>,
    pub codec: Arc<Codec>,
    pub requester: Requester,
    pub components: ComponentRegistry,
    pub broadcaster: Broadcaster,
    pub helpers: HelperProcesses,
    pub events: EventPublisher,
    pub objects: Arc<dyn ObjectStatus>,
    pub stop: StopHandle,
    state: RwLock<ListenerState>,
    transports: RwLock<Vec<String>>,
    started: Instant,
}

impl AgentContext {
    /// Build the context around a config store. The returned queue is the
    /// consumer side of [`AgentContext::events`].
    pub fn new(store: Arc<ConfigStore>, objects: Arc<dyn ObjectStatus>) -> (Self, EventQueue) {
        let config = store.get();
        let (events, queue) = EventQueue::bounded(config.event_queue_capacity());
        let ledger = Arc::new(Ledger::new());
        let keyring = Arc::new(Keyring::from_store(store.clone()));
        let codec = Arc::new(
            Codec::new(&config.nodename(), keyring, ledger.clone()).with_events(events.clone()),
        );
        let requester = Requester::new(store.clone(), codec.clone());

        let ctx = Self {
            store,
            ledger,
            codec,
            requester,
            components: ComponentRegistry::new(),
            broadcaster: Broadcaster::new(config.event_queue_capacity()),
            helpers: HelperProcesses::new(),
            events,
            objects,
            stop: StopHandle::new(),
            state: RwLock::new(ListenerState::Binding),
            transports: RwLock::new(Vec::new()),
            started: Instant::now(),
        };
        (ctx, queue)
    }

    pub fn nodename(&self) -> String {
        self.codec.nodename().to_string()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read().expect("state lock")
    }

    pub fn set_state(&self, state: ListenerState) {
        *self.state.write().expect("state lock") = state;
    }

    /// Descriptions of the bound transports.
    pub fn transports(&self) -> Vec<String> {
        self.transports.read().expect("transports lock").clone()
    }

    pub(crate) fn set_transports(&self, transports: Vec<String>) {
        *self.transports.write().expect("transports lock") = transports;
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
