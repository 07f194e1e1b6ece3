//! Payload encryption and the `encrypted_payload` wire format.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use serde_json::{Value, json};

use crate::{CryptoError, key::KeyStore};

/// ChaCha20-Poly1305 nonce length (12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag length (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Encrypts and decrypts payload envelopes under the store's active key.
#[derive(Debug, Default)]
pub struct CryptoService {
    keys: KeyStore,
}

impl CryptoService {
    /// Service over an already-populated key store.
    #[must_use]
    pub fn new(keys: KeyStore) -> Self {
        Self { keys }
    }

    /// The underlying key store (for loading and rotation).
    #[must_use]
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Encrypt `plaintext` under the active key.
    ///
    /// Returns the wire blob `nonce || ciphertext || tag` with a fresh random
    /// 12-byte nonce.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::NoActiveKey`] if no usable key is loaded
    /// - [`CryptoError::EncryptFailed`] if the AEAD rejects the input
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.keys.active().ok_or(CryptoError::NoActiveKey)?;
        let cipher = ChaCha20Poly1305::new(key.material().into());

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut wire = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Decrypt a `nonce || ciphertext || tag` wire blob.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::NoActiveKey`] if no usable key is loaded
    /// - [`CryptoError::InvalidPayload`] if the blob is shorter than
    ///   nonce + tag
    /// - [`CryptoError::DecryptFailed`] on authentication failure
    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.keys.active().ok_or(CryptoError::NoActiveKey)?;

        if wire.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidPayload(format!(
                "blob of {} bytes cannot hold nonce and tag",
                wire.len()
            )));
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new(key.material().into());
        cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::DecryptFailed)
    }

    /// Serialize `payload` to JSON, encrypt it, and wrap it as
    /// `{"encrypted_payload": "<base64>"}`.
    ///
    /// # Errors
    ///
    /// Propagates [`CryptoService::encrypt`] failures;
    /// [`CryptoError::InvalidPayload`] if the value cannot be serialized.
    pub fn wrap_payload(&self, payload: &Value) -> Result<Value, CryptoError> {
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| CryptoError::InvalidPayload(e.to_string()))?;
        let wire = self.encrypt(&plaintext)?;
        Ok(json!({ "encrypted_payload": STANDARD.encode(wire) }))
    }

    /// Decode, decrypt, and deserialize an `encrypted_payload` string.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidPayload`] on bad base64 or non-JSON plaintext;
    /// otherwise propagates [`CryptoService::decrypt`] failures.
    pub fn unwrap_payload(&self, encoded: &str) -> Result<Value, CryptoError> {
        let wire = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidPayload(format!("bad base64: {e}")))?;
        let plaintext = self.decrypt(&wire)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::InvalidPayload(format!("plaintext is not JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::key::{EncryptionKey, KEY_SIZE};

    fn service(material: [u8; KEY_SIZE]) -> CryptoService {
        let store = KeyStore::new();
        store
            .load(vec![EncryptionKey::new(Uuid::new_v4(), "test", material).activated()])
            .expect("load");
        CryptoService::new(store)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let service = service([1u8; KEY_SIZE]);
        let plaintext = b"hello-encryption";

        let wire = service.encrypt(plaintext).expect("encrypt");
        assert_ne!(&wire[NONCE_SIZE..], plaintext);
        assert_eq!(wire.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let decrypted = service.decrypt(&wire).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn nonces_are_unique_per_message() {
        let service = service([2u8; KEY_SIZE]);
        let a = service.encrypt(b"same").expect("encrypt");
        let b = service.encrypt(b"same").expect("encrypt");
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a[NONCE_SIZE..], b[NONCE_SIZE..]);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let service = service([3u8; KEY_SIZE]);
        let mut wire = service.encrypt(b"original").expect("encrypt");
        wire[NONCE_SIZE] ^= 0xFF;
        assert_eq!(service.decrypt(&wire), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let wire = service([4u8; KEY_SIZE]).encrypt(b"secret").expect("encrypt");
        assert_eq!(service([5u8; KEY_SIZE]).decrypt(&wire), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn short_blob_is_invalid_payload() {
        let service = service([6u8; KEY_SIZE]);
        assert!(matches!(
            service.decrypt(&[0u8; NONCE_SIZE]),
            Err(CryptoError::InvalidPayload(_))
        ));
    }

    #[test]
    fn no_active_key_is_reported() {
        let service = CryptoService::new(KeyStore::new());
        assert_eq!(service.encrypt(b"x"), Err(CryptoError::NoActiveKey));
        assert_eq!(service.decrypt(&[0u8; 64]), Err(CryptoError::NoActiveKey));
    }

    #[test]
    fn wrap_and_unwrap_payload() {
        let service = service([7u8; KEY_SIZE]);
        let payload = serde_json::json!({"message": "hello", "value": 42});

        let wrapped = service.wrap_payload(&payload).expect("wrap");
        let encoded = wrapped["encrypted_payload"].as_str().expect("envelope field");

        let unwrapped = service.unwrap_payload(encoded).expect("unwrap");
        assert_eq!(unwrapped, payload);
    }

    #[test]
    fn unwrap_rejects_garbage() {
        let service = service([8u8; KEY_SIZE]);
        assert!(matches!(
            service.unwrap_payload("not-base64!"),
            Err(CryptoError::InvalidPayload(_))
        ));
    }
}
