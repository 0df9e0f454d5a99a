//! Per-connection key store

use dashmap::DashMap;

use bs_core::crypto::{self, EncryptionKey};
use bs_core::error::CryptoError;
use bs_core::ConnectionId;

/// Symmetric keys bound 1:1 to connection identities
///
/// Keys live only in memory and are dropped on disconnect.
pub struct KeyStore {
    keys: DashMap<ConnectionId, EncryptionKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Generate and store a fresh key, replacing any previous one
    pub fn issue(&self, id: &ConnectionId) -> Result<EncryptionKey, CryptoError> {
        if id.is_blank() {
            return Err(CryptoError::InvalidInput(
                "connection id must not be empty".to_string(),
            ));
        }

        let key = EncryptionKey::generate();
        self.keys.insert(id.clone(), key.clone());
        tracing::debug!("Issued encryption key for {}", id);
        Ok(key)
    }

    /// Open a sealed chunk with the connection's key
    pub fn decrypt(&self, id: &ConnectionId, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Clone out so the shard lock is not held during AEAD
        let key = self
            .keys
            .get(id)
            .map(|k| k.value().clone())
            .ok_or(CryptoError::KeyNotFound)?;
        crypto::open(&key, sealed)
    }

    /// Drop the connection's key. Idempotent.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.keys.remove(id).is_some();
        if removed {
            tracing::debug!("Removed encryption key for {}", id);
        }
        removed
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.keys.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}
