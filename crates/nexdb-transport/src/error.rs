//! Errors surfaced by a circuit's public operations.
//!
//! Integrity failures (checksum, decrypt, decompress) only ever cost the
//! frame or message they concern; the circuit itself keeps working.

use nexdb_core::compress::CompressError;
use nexdb_core::crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Not enough bytes arrived within the wait. Normal end of a drain pass.
    #[error("timed out waiting on the circuit buffer")]
    Timeout,

    /// Backpressure: the buffer stayed full through the retry.
    #[error("buffer still full after retry")]
    BufferFull,

    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { len: usize, max: usize },

    /// The inbound stream was desynchronised and has been cleared.
    #[error("implausible frame length {declared}; inbound stream cleared")]
    Protocol { declared: u32 },

    /// A frame of plausible length that still failed to decode. Only that
    /// frame was consumed.
    #[error("malformed frame of {declared} bytes; frame dropped")]
    Malformed { declared: u32 },

    #[error("checksum mismatch on msg {msg_id} segment {segment}; frame dropped")]
    Checksum { msg_id: u32, segment: u32 },

    #[error("could not decrypt msg {msg_id} segment {segment}; frame dropped")]
    Decrypt { msg_id: u32, segment: u32 },

    #[error("could not decompress msg {msg_id}; message dropped")]
    Decompress { msg_id: u32 },

    /// Encryption is enabled but no transmit key has been installed.
    #[error("encryption enabled without a session key")]
    NoSessionKey,

    #[error("encryption failed: {0}")]
    Encrypt(#[from] CryptoError),

    #[error("compression failed: {0}")]
    Compress(#[from] CompressError),

    #[error("circuit stopped")]
    Stopped,
}
