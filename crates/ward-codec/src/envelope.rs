//! Envelope codec — seal and open cluster messages.
//!
//! # Wire format
//!
//! ```text
//! {"clustername": "...", "nodename": "...", "iv": <b64>, "data": <b64>}\0
//!
//! data = AES-256-CBC(key, iv, PKCS7(zlib(payload)))
//! ```
//!
//! Opening never fails loudly: every problem is logged and the message is
//! rejected. Only cryptographic failures count against the sender.

use std::collections::BTreeSet;
use std::sync::Arc;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use ward_core::{Event, EventPublisher, Ledger};

use crate::error::{CodecError, CodecResult};
use crate::frame::TERMINATOR;
use crate::iv::{IV_LEN, IvPool};
use crate::secret::{ClusterSecret, JOIN_CLUSTER, Keyring};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Upper bound on an inflated payload.
pub const MAX_INFLATED_BYTES: usize = 64 * 1024 * 1024;

/// The JSON wrapper carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub clustername: String,
    pub nodename: String,
    pub iv: String,
    pub data: String,
}

/// Outcome of opening a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decrypted {
    /// A JSON object or array (RPC requests and replies).
    Structured {
        cluster: String,
        node: String,
        value: Value,
    },
    /// Anything else, such as a batch of log lines.
    Raw {
        cluster: String,
        node: String,
        bytes: Vec<u8>,
    },
    Rejected,
}

impl Decrypted {
    /// Classify a decoded payload.
    pub fn from_payload(cluster: String, node: String, payload: Vec<u8>) -> Self {
        match serde_json::from_slice::<Value>(&payload) {
            Ok(value @ (Value::Object(_) | Value::Array(_))) => Decrypted::Structured {
                cluster,
                node,
                value,
            },
            _ => Decrypted::Raw {
                cluster,
                node,
                bytes: payload,
            },
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Decrypted::Rejected)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Decrypted::Structured { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Decrypted::Structured { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Sender node name as written in the envelope.
    pub fn node(&self) -> Option<&str> {
        match self {
            Decrypted::Structured { node, .. } | Decrypted::Raw { node, .. } => Some(node),
            Decrypted::Rejected => None,
        }
    }

    pub fn cluster(&self) -> Option<&str> {
        match self {
            Decrypted::Structured { cluster, .. } | Decrypted::Raw { cluster, .. } => {
                Some(cluster)
            }
            Decrypted::Rejected => None,
        }
    }
}

/// Seals outgoing and opens incoming messages for one node.
pub struct Codec {
    nodename: String,
    keyring: Arc<Keyring>,
    ledger: Arc<Ledger>,
    events: Option<EventPublisher>,
    ivs: IvPool,
    max_inflated: usize,
}

impl Codec {
    pub fn new(nodename: &str, keyring: Arc<Keyring>, ledger: Arc<Ledger>) -> Self {
        Self {
            nodename: nodename.to_string(),
            keyring,
            ledger,
            events: None,
            ivs: IvPool::new(),
            max_inflated: MAX_INFLATED_BYTES,
        }
    }

    /// Builder method: publish blacklist events.
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Builder method: cap the inflated payload size.
    pub fn with_max_inflated(mut self, bytes: usize) -> Self {
        self.max_inflated = bytes;
        self
    }

    pub fn nodename(&self) -> &str {
        &self.nodename
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    // ── Sealing ────────────────────────────────────────────────

    /// Seal a serializable payload as a terminated envelope.
    ///
    /// `cluster_name` defaults to the local cluster; `secret` defaults to
    /// the keyring's choice for that cluster. `MissingSecret` means the
    /// message cannot be sent.
    pub fn encrypt<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        cluster_name: Option<&str>,
        secret: Option<&ClusterSecret>,
    ) -> CodecResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(payload)?;
        self.encrypt_bytes(&plaintext, cluster_name, secret)
    }

    /// Seal raw bytes as a terminated envelope.
    pub fn encrypt_bytes(
        &self,
        plaintext: &[u8],
        cluster_name: Option<&str>,
        secret: Option<&ClusterSecret>,
    ) -> CodecResult<Vec<u8>> {
        let cluster = cluster_name
            .map(str::to_string)
            .unwrap_or_else(|| self.keyring.cluster_name());
        let key = self
            .keyring
            .resolve(&cluster, secret)
            .ok_or_else(|| CodecError::MissingSecret(cluster.clone()))?;

        let iv = self.ivs.next();
        let compressed = deflate(plaintext)?;
        let ciphertext = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
            .map_err(|e| CodecError::Cipher(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(&compressed);

        let envelope = Envelope {
            clustername: cluster,
            nodename: self.nodename.clone(),
            iv: STANDARD.encode(iv),
            data: STANDARD.encode(ciphertext),
        };
        let mut out = serde_json::to_vec(&envelope)?;
        out.push(TERMINATOR);
        Ok(out)
    }

    // ── Opening ────────────────────────────────────────────────

    /// Open a message from `sender`, accepting the keyring's cluster names.
    pub fn decrypt(&self, raw: &[u8], sender: &str) -> Decrypted {
        let accepted = self.keyring.accepted_names();
        self.decrypt_with(raw, &accepted, None, sender)
    }

    /// Open a message from `sender`.
    ///
    /// The envelope's cluster name must be `join` or one of `accepted`.
    pub fn decrypt_with(
        &self,
        raw: &[u8],
        accepted: &BTreeSet<String>,
        secret_override: Option<&ClusterSecret>,
        sender: &str,
    ) -> Decrypted {
        let raw = strip_terminator(raw);
        let envelope: Envelope = match serde_json::from_slice(raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(%sender, error = %e, "malformed envelope dropped");
                return Decrypted::Rejected;
            }
        };

        if envelope.clustername != JOIN_CLUSTER && !accepted.contains(&envelope.clustername) {
            warn!(
                %sender,
                cluster = %envelope.clustername,
                "message for a foreign cluster dropped"
            );
            return Decrypted::Rejected;
        }

        let Some(key) = self.keyring.resolve(&envelope.clustername, secret_override) else {
            warn!(%sender, cluster = %envelope.clustername, "no secret to decrypt with");
            return Decrypted::Rejected;
        };

        if self.ledger.is_blacklisted(sender) {
            debug!(%sender, "blacklisted sender, message dropped unread");
            return Decrypted::Rejected;
        }

        match open(&envelope, &key, self.max_inflated) {
            Ok(payload) => {
                self.ledger.record_decrypt_success(sender);
                Decrypted::from_payload(envelope.clustername, envelope.nodename, payload)
            }
            Err(e) => {
                let record = self.ledger.record_decrypt_failure(sender);
                debug!(%sender, error = %e, failures = record.count, "decrypt failed");
                if record.crossed {
                    warn!(%sender, failures = record.count, "sender blacklisted");
                    if let Some(events) = &self.events {
                        events.publish(Event::new(
                            "blacklist_add",
                            json!({"sender": sender, "failures": record.count}),
                        ));
                    }
                }
                Decrypted::Rejected
            }
        }
    }
}

/// Drop trailing frame terminators.
pub fn strip_terminator(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|b| *b != TERMINATOR)
        .map_or(0, |i| i + 1);
    &raw[..end]
}

fn open(envelope: &Envelope, key: &ClusterSecret, max_inflated: usize) -> CodecResult<Vec<u8>> {
    let iv = STANDARD.decode(&envelope.iv)?;
    if iv.len() != IV_LEN {
        return Err(CodecError::IvLength(iv.len()));
    }
    let ciphertext = STANDARD.decode(&envelope.data)?;
    let compressed = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CodecError::Cipher(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| CodecError::Cipher(e.to_string()))?;
    inflate(&compressed, max_inflated)
}

fn deflate(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut z = Compress::new(Compression::default(), true);
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(64));
        }
        let consumed = z.total_in() as usize;
        let status = z
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Finish)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        if status == Status::StreamEnd {
            return Ok(out);
        }
    }
}

/// Inflate a complete zlib stream, refusing output larger than `limit`.
fn inflate(data: &[u8], limit: usize) -> CodecResult<Vec<u8>> {
    let mut z = Decompress::new(true);
    let mut out = Vec::with_capacity((data.len() * 4).min(limit).max(64));
    loop {
        if out.len() == out.capacity() {
            if out.len() >= limit {
                return Err(CodecError::TooLarge(limit));
            }
            let grow = out.capacity().min(limit - out.len()).max(64);
            out.reserve(grow);
        }
        let (in_before, out_before) = (z.total_in(), z.total_out());
        let consumed = in_before as usize;
        let status = z
            .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        if status == Status::StreamEnd {
            return Ok(out);
        }
        let stalled = z.total_in() == in_before && z.total_out() == out_before;
        if stalled && out.len() < out.capacity() {
            return Err(CodecError::Compression("truncated stream".to_string()));
        }
    }
}
