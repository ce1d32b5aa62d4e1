//! Codec error types.

use thiserror::Error;

/// Result type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while sealing or opening an envelope.
///
/// `decrypt` never surfaces these to callers; they are logged and folded
/// into a rejection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no secret available for cluster {0}")]
    MissingSecret(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid iv length {0}")]
    IvLength(usize),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompressed payload exceeds {0} bytes")]
    TooLarge(usize),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised while reading a frame from a stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("timed out waiting for data")]
    Timeout,

    #[error("message exceeds {0} bytes")]
    TooLarge(usize),

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}
