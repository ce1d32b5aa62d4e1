//! Transport error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("not a known local socket: {}", .0.display())]
    UnknownSocket(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("http/2 error: {0}")]
    Http(String),

    #[error("codec error: {0}")]
    Codec(#[from] ward_codec::CodecError),

    #[error("frame error: {0}")]
    Frame(#[from] ward_codec::FrameError),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed before a response")]
    Closed,

    #[error("response rejected")]
    Rejected,
}

impl From<rustls::Error> for TransportError {
    fn from(e: rustls::Error) -> Self {
        TransportError::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for TransportError {
    fn from(e: rcgen::Error) -> Self {
        TransportError::Certificate(e.to_string())
    }
}

impl From<hyper::Error> for TransportError {
    fn from(e: hyper::Error) -> Self {
        TransportError::Http(e.to_string())
    }
}
