//! AEAD payload envelope for encrypted gateway traffic.
//!
//! Encrypted payloads travel as a single opaque blob:
//!
//! ```text
//! nonce (12 bytes) || ciphertext || Poly1305 tag (16 bytes)
//! ```
//!
//! base64-encoded when carried inside JSON
//! (`{"encrypted_payload": "<base64>"}`). One AEAD algorithm per deployment:
//! ChaCha20-Poly1305 with a fresh random nonce per message.
//!
//! Key material lives in a [`KeyStore`] holding at most one active key. The
//! store is loaded at startup and replaced only by an explicit rotate; reads
//! are a lock-free pointer load, so per-message encryption never contends
//! with rotation.

#![forbid(unsafe_code)]

mod envelope;
mod key;

pub use envelope::{CryptoService, NONCE_SIZE, TAG_SIZE};
pub use key::{EncryptionKey, KEY_SIZE, KeyStore};

use thiserror::Error;

/// Errors from key management and envelope crypto.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// No usable key: none loaded, none active, or the active key expired.
    #[error("no active encryption key")]
    NoActiveKey,

    /// Key material is malformed (wrong length, bad encoding, duplicate
    /// active flag).
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Wire blob is structurally wrong (bad base64, shorter than
    /// nonce + tag, or non-JSON plaintext).
    #[error("invalid encrypted payload: {0}")]
    InvalidPayload(String),

    /// Authentication failed: wrong key or tampered ciphertext.
    #[error("decryption failed: authentication error")]
    DecryptFailed,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptFailed,
}

/// Convenience result alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
