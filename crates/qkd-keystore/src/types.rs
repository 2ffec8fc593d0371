//! Core types shared by key stores, the factory and transports

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KeyStoreError, Result};

/// Sequence number identifying one key within a single key store
pub type KeyId = u64;

/// Context string for key confirmation digests
const KEY_CONFIRMATION_CONTEXT: &str = "qkd-keystore 2024 key confirmation v1";

/// A pre-shared key. The bytes are wiped when the value is dropped.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Psk(Vec<u8>);

impl Psk {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// An empty key marks an id that has been claimed but not yet generated
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }

    /// XOR `other` into this key in place
    pub fn xor_with(&mut self, other: &Psk) -> Result<()> {
        if self.len() != other.len() {
            return Err(KeyStoreError::Internal(format!(
                "Key lengths don't match: {} != {}",
                self.len(),
                other.len()
            )));
        }

        for (left, right) in self.0.iter_mut().zip(other.0.iter()) {
            *left ^= right;
        }
        Ok(())
    }

    /// Digest used by both ends of a link to confirm they hold the same bytes
    pub fn digest(&self) -> KeyDigest {
        let mut hasher = blake3::Hasher::new_derive_key(KEY_CONFIRMATION_CONTEXT);
        hasher.update(&self.0);
        KeyDigest(*hasher.finalize().as_bytes())
    }
}

impl From<Vec<u8>> for Psk {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print key material
        write!(f, "Psk({} bytes)", self.0.len())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDigest([u8; 32]);

impl KeyDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix suitable for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({})", self.short())
    }
}

/// A key handed to a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedKey {
    pub key_id: KeyId,
    pub key_value: Psk,
    /// PKCS#11 style reference to the key, independent of its value
    pub url: String,
}

/// Request for a new key (`key_id == None`) or an existing one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub site_to: String,
    pub key_id: Option<KeyId>,
}

/// Reply to `mark_key_in_use`: the id the peer has reserved for us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedKey {
    pub key_id: KeyId,
    pub digest: KeyDigest,
}

/// Ask the terminal site of `sites` to build a relayed key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPathRequest {
    /// `[origin, hop1, ..., terminal]`
    pub sites: Vec<String>,
    pub originating_key_id: KeyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedKeyRequest {
    pub left_site: String,
    /// `None` asks the hop to allocate a fresh key with `left_site`
    pub left_key_id: Option<KeyId>,
    pub right_site: String,
    pub right_key_id: KeyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedKeyResponse {
    pub combined_key: Psk,
    pub left_id: KeyId,
}
