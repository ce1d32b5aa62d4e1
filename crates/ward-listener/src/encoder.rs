//! Reply encoding, plain or sealed, as negotiated by the request.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::error;

use ward_codec::{Codec, encode_plain, encode_plain_bytes};

/// How replies on one connection are encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncodingMode {
    Plain,
    /// Sealed envelope carrying this cluster name.
    Sealed(String),
}

/// Encodes reply frames for one connection.
#[derive(Clone)]
pub struct ReplyEncoder {
    codec: Arc<Codec>,
    mode: EncodingMode,
}

impl ReplyEncoder {
    pub fn plain(codec: Arc<Codec>) -> Self {
        Self {
            codec,
            mode: EncodingMode::Plain,
        }
    }

    /// Replies sealed for `cluster`, the cluster name the request came in with.
    pub fn sealed(codec: Arc<Codec>, cluster: &str) -> Self {
        Self {
            codec,
            mode: EncodingMode::Sealed(cluster.to_string()),
        }
    }

    pub fn mode(&self) -> &EncodingMode {
        &self.mode
    }

    /// Encode a JSON reply. `None` when it cannot be sealed.
    pub fn encode(&self, value: &Value) -> Option<Bytes> {
        let frame = match &self.mode {
            EncodingMode::Plain => encode_plain(value),
            EncodingMode::Sealed(cluster) => self.codec.encrypt(value, Some(cluster), None),
        };
        match frame {
            Ok(frame) => Some(Bytes::from(frame)),
            Err(e) => {
                error!(error = %e, "cannot encode reply");
                None
            }
        }
    }

    /// Encode a raw payload, such as a batch of log lines.
    pub fn encode_bytes(&self, data: &[u8]) -> Option<Bytes> {
        match &self.mode {
            EncodingMode::Plain => Some(Bytes::from(encode_plain_bytes(data))),
            EncodingMode::Sealed(cluster) => match self.codec.encrypt_bytes(data, Some(cluster), None) {
                Ok(frame) => Some(Bytes::from(frame)),
                Err(e) => {
                    error!(error = %e, "cannot encode payload");
                    None
                }
            },
        }
    }
}

/// The empty frame written to idle streams.
pub fn heartbeat() -> Bytes {
    Bytes::from_static(b"\0")
}
