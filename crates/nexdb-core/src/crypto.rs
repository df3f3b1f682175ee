//! Cryptographic primitives for circuit encryption.
//!
//! Provides three things:
//!   1. `SessionKey`, a 32-byte symmetric key, wiped from memory on drop
//!   2. `Cipher`, the AEAD seam the transport calls as a black box
//!   3. `ChaChaPoly`, the default `Cipher`, ChaCha20-Poly1305 via ring
//!
//! Key derivation uses BLAKE3 in derive-key mode so both ends can expand a
//! shared secret into per-direction keys without coordination.
//! There is no unsafe code in this module.

use std::fmt;

use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;

/// Poly1305 tag length appended to every sealed payload.
pub const TAG_LEN: usize = 16;

// ── Session keys ─────────────────────────────────────────────────────────────

/// Symmetric key for one direction of one circuit.
///
/// Zeroized on drop. `Debug` prints a fingerprint, never the key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Random key, mostly useful in tests and for ad hoc circuits.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a key from shared secret material.
    ///
    /// `context` must be a hardcoded, application-unique string, e.g.
    /// `"nexdb 2026 circuit client->server"`. Distinct contexts over the
    /// same secret produce independent keys.
    pub fn derive(context: &str, secret: &[u8]) -> Self {
        Self(blake3::derive_key(context, secret))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// First 8 bytes of the key's BLAKE3 hash, hex-encoded. Safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.0).as_bytes()[..8])
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

// ── Cipher seam ──────────────────────────────────────────────────────────────

/// Authenticated encryption as the transport sees it.
///
/// Implementations must be stateless with respect to the key: the transport
/// swaps keys at runtime and passes the current one on every call.
pub trait Cipher: Send + Sync {
    /// Bytes added to a plaintext by `encrypt` (nonce, tag, ...).
    fn overhead(&self) -> usize;

    fn encrypt(
        &self,
        key: &SessionKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        key: &SessionKey,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// ChaCha20-Poly1305 with a random 96-bit nonce per message.
///
/// Output layout:
///   [nonce (12 bytes)] [ciphertext (len(plaintext))] [tag (16 bytes)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaPoly;

impl ChaChaPoly {
    fn key(key: &SessionKey) -> Result<LessSafeKey, CryptoError> {
        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::BadKey)?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl Cipher for ChaChaPoly {
    fn overhead(&self) -> usize {
        NONCE_LEN + TAG_LEN
    }

    fn encrypt(
        &self,
        key: &SessionKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let sealing = Self::key(key)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut in_out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        in_out.extend_from_slice(plaintext);
        sealing
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn decrypt(
        &self,
        key: &SessionKey,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort(ciphertext.len()));
        }
        let opening = Self::key(key)?;

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let mut in_out = sealed.to_vec();
        let plaintext = opening
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::OpenFailed)?;
        Ok(plaintext.to_vec())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key rejected by the AEAD implementation")]
    BadKey,

    #[error("AEAD seal failed")]
    SealFailed,

    #[error("ciphertext of {0} bytes is shorter than nonce + tag")]
    TooShort(usize),

    #[error("authentication failed (wrong key or AAD, or tampered ciphertext)")]
    OpenFailed,
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SessionKey::generate();
        let ct = ChaChaPoly.encrypt(&key, b"ping", b"aad").unwrap();
        assert_eq!(ct.len(), 4 + ChaChaPoly.overhead());
        assert_ne!(&ct[NONCE_LEN..NONCE_LEN + 4], b"ping");

        let pt = ChaChaPoly.decrypt(&key, &ct, b"aad").unwrap();
        assert_eq!(pt, b"ping");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let ct = ChaChaPoly
            .encrypt(&SessionKey::generate(), b"secret", b"")
            .unwrap();
        assert_eq!(
            ChaChaPoly.decrypt(&SessionKey::generate(), &ct, b""),
            Err(CryptoError::OpenFailed)
        );
    }

    #[test]
    fn wrong_aad_is_rejected() {
        let key = SessionKey::generate();
        let ct = ChaChaPoly.encrypt(&key, b"secret", b"msg 1").unwrap();
        assert!(ChaChaPoly.decrypt(&key, &ct, b"msg 2").is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = SessionKey::generate();
        let mut ct = ChaChaPoly.encrypt(&key, b"important data", b"").unwrap();
        ct[NONCE_LEN + 2] ^= 0xFF;
        assert!(ChaChaPoly.decrypt(&key, &ct, b"").is_err());
    }

    #[test]
    fn too_short_ciphertext_rejected() {
        let key = SessionKey::generate();
        assert_eq!(
            ChaChaPoly.decrypt(&key, &[0u8; 20], b""),
            Err(CryptoError::TooShort(20))
        );
    }

    #[test]
    fn nonces_differ_between_messages() {
        let key = SessionKey::generate();
        let a = ChaChaPoly.encrypt(&key, b"same", b"").unwrap();
        let b = ChaChaPoly.encrypt(&key, b"same", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn derive_is_deterministic_and_context_separated() {
        let a = SessionKey::derive("nexdb test client->server", b"shared");
        let b = SessionKey::derive("nexdb test client->server", b"shared");
        let c = SessionKey::derive("nexdb test server->client", b"shared");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn debug_does_not_leak_key() {
        let key = SessionKey::from_bytes([0xAB; KEY_LEN]);
        let printed = format!("{key:?}");
        assert!(!printed.contains(&hex::encode(key.as_bytes())));
        assert!(printed.contains(&key.fingerprint()));
        assert_eq!(key.fingerprint().len(), 16);
    }
}
