//! Listener error types.

use thiserror::Error;

/// Result type alias for listener operations.
pub type ListenerResult<T> = Result<T, ListenerError>;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {transport}: {source}")]
    Bind {
        transport: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("no transport could be bound")]
    NoTransport,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ward_core::ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] ward_transport::TransportError),
}
