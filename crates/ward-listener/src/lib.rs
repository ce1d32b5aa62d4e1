//! Ward listener daemon.
//!
//! Accepts requests on the local Unix sockets, raw TCP and TLS/HTTP2,
//! routes them to action handlers and streams logs and events back.

pub mod actions;
pub mod components;
pub mod connection;
pub mod context;
pub mod daemon;
pub mod encoder;
pub mod error;
pub mod events;
pub mod h2;
pub mod helpers;
pub mod logs;
pub mod router;

pub use components::{Component, ComponentRegistry};
pub use connection::Peer;
pub use context::{AgentContext, ListenerState, NoObjects, ObjectStatus, StopHandle};
pub use daemon::{BoundListener, Listener};
pub use encoder::{EncodingMode, ReplyEncoder};
pub use error::{ListenerError, ListenerResult};
pub use events::Broadcaster;
pub use router::{ActionHandler, Reply, RequestContext, Router};
