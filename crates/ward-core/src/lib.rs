//! ward-core — shared pieces of the Ward cluster agent.
//!
//! - **`config`** — `node.toml` parsing and defaults
//! - **`store`** — live config with digest-based reload
//! - **`ledger`** — per-sender blacklist and session statistics
//! - **`events`** — bounded event queue feeding subscribers
//! - **`request`** — action request/result payloads

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod request;
pub mod store;

pub use config::AgentConfig;
pub use error::{ConfigError, ConfigResult};
pub use events::{Event, EventPublisher, EventQueue};
pub use ledger::{Ledger, LOCAL_SENDER};
pub use request::{ActionRequest, NodeSelector, Options};
pub use store::ConfigStore;
