//! Encryption key model and active-key store.

use std::{fmt, sync::Arc, time::SystemTime};

use arc_swap::ArcSwapOption;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use uuid::Uuid;

use crate::CryptoError;

/// Symmetric key length in bytes.
pub const KEY_SIZE: usize = 32;

/// A 256-bit symmetric key with rotation metadata.
///
/// Key material is private; it is reachable only by the crypto service in
/// this crate and is excluded from `Debug` output.
#[derive(Clone)]
pub struct EncryptionKey {
    /// Key identity.
    pub id: Uuid,
    /// Operator-assigned key name.
    pub name: String,
    /// Whether this key is the deployment's active key.
    pub is_active: bool,
    /// When this key last became active.
    pub rotated_at: Option<SystemTime>,
    /// When this key stops being usable.
    pub expires_at: Option<SystemTime>,
    material: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Create a key from raw material.
    #[must_use]
    pub fn new(id: Uuid, name: impl Into<String>, material: [u8; KEY_SIZE]) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: false,
            rotated_at: None,
            expires_at: None,
            material,
        }
    }

    /// Create a key from base64-encoded material.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidKey`] if the encoding is malformed or the
    /// decoded material is not exactly [`KEY_SIZE`] bytes.
    pub fn from_base64(
        id: Uuid,
        name: impl Into<String>,
        encoded: &str,
    ) -> Result<Self, CryptoError> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("bad base64: {e}")))?;
        let material: [u8; KEY_SIZE] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| {
                CryptoError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", v.len()))
            })?;
        Ok(Self::new(id, name, material))
    }

    /// Mark the key active.
    #[must_use]
    pub fn activated(mut self) -> Self {
        self.is_active = true;
        self
    }

    /// Whether the key is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub(crate) fn material(&self) -> &[u8; KEY_SIZE] {
        &self.material
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_active", &self.is_active)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Holder of the deployment's single active key.
///
/// Loaded once at startup and replaced by explicit [`KeyStore::rotate`]
/// calls; [`KeyStore::active`] is a lock-free pointer load, safe to call on
/// every message.
#[derive(Debug, Default)]
pub struct KeyStore {
    active: ArcSwapOption<EncryptionKey>,
}

impl KeyStore {
    /// Create an empty store (encryption unavailable until a key is loaded).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load keys, installing the single `is_active` one.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidKey`] if more than one key is flagged active.
    pub fn load(&self, keys: impl IntoIterator<Item = EncryptionKey>) -> Result<(), CryptoError> {
        let mut active: Option<EncryptionKey> = None;
        for key in keys {
            if !key.is_active {
                continue;
            }
            if let Some(prior) = &active {
                return Err(CryptoError::InvalidKey(format!(
                    "keys `{}` and `{}` are both active",
                    prior.name, key.name
                )));
            }
            active = Some(key);
        }

        match active {
            Some(key) => {
                tracing::info!(key = %key.name, "active encryption key loaded");
                self.active.store(Some(Arc::new(key)));
            },
            None => self.active.store(None),
        }
        Ok(())
    }

    /// Replace the active key.
    ///
    /// The new key is marked active and stamped with the rotation time; the
    /// previous key is dropped. In-flight encryptions that already loaded the
    /// old pointer finish under the old key.
    pub fn rotate(&self, mut key: EncryptionKey) {
        key.is_active = true;
        key.rotated_at = Some(SystemTime::now());
        tracing::info!(key = %key.name, "encryption key rotated");
        self.active.store(Some(Arc::new(key)));
    }

    /// The active, unexpired key, if any.
    #[must_use]
    pub fn active(&self) -> Option<Arc<EncryptionKey>> {
        let key = self.active.load_full()?;
        if key.is_expired(SystemTime::now()) {
            tracing::warn!(key = %key.name, "active encryption key is expired");
            return None;
        }
        Some(key)
    }
}
