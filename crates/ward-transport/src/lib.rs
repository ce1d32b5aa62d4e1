//! Ward transports.
//!
//! Destination resolution, cluster TLS material and the requester used by
//! the CLI and by nodes forwarding requests to their peers.

pub mod client;
pub mod error;
pub mod resolver;
pub mod tls;

pub use client::{Requester, ResponseStream, Seal, StreamItem};
pub use error::{TransportError, TransportResult};
pub use resolver::{Address, AddressFamily, Scheme, SocketParams, resolve};
