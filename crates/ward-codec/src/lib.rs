//! Ward message codec.
//!
//! Cluster secrets, the encrypted envelope and NUL framing shared by the
//! listener and the requester.

pub mod envelope;
pub mod error;
pub mod frame;
pub mod iv;
pub mod secret;

pub use envelope::{Codec, Decrypted, Envelope};
pub use error::{CodecError, CodecResult, FrameError};
pub use frame::{
    FrameBuffer, TERMINATOR, decode_plain, encode_plain, encode_plain_bytes, is_broken_pipe,
    read_frame, write_chunked,
};
pub use secret::{ClusterSecret, JOIN_CLUSTER, Keyring};
