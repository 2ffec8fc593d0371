//! Simulated key link
//!
//! Stands in for the key generator of a real QKD link: it produces random
//! key material and delivers the same batch, in the same order, to the key
//! stores at both ends.

use std::sync::Arc;

use rand::RngCore;
use tracing::debug;

use crate::error::{KeyStoreError, Result};
use crate::factory::KeyStoreFactory;
use crate::keystore::KeyStore;
use crate::types::Psk;

pub struct KeyLink {
    left: Arc<KeyStore>,
    right: Arc<KeyStore>,
    key_length: usize,
}

impl KeyLink {
    pub fn new(left: Arc<KeyStore>, right: Arc<KeyStore>, key_length: usize) -> Self {
        Self {
            left,
            right,
            key_length,
        }
    }

    /// Link the stores `a` and `b` hold for each other
    pub fn between(a: &KeyStoreFactory, b: &KeyStoreFactory, key_length: usize) -> Result<Self> {
        let missing = |from: &KeyStoreFactory, to: &KeyStoreFactory| {
            KeyStoreError::InvalidArgument(format!(
                "No key store from {} to {}",
                from.site_address(),
                to.site_address()
            ))
        };

        let left = a.get_key_store(b.site_address()).ok_or_else(|| missing(a, b))?;
        let right = b.get_key_store(a.site_address()).ok_or_else(|| missing(b, a))?;
        Ok(Self::new(left, right, key_length))
    }

    pub fn left(&self) -> &Arc<KeyStore> {
        &self.left
    }

    pub fn right(&self) -> &Arc<KeyStore> {
        &self.right
    }

    fn random_keys(&self, count: usize) -> Vec<Psk> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let mut bytes = vec![0u8; self.key_length];
                rng.fill_bytes(&mut bytes);
                Psk::new(bytes)
            })
            .collect()
    }

    /// Generate `count` keys and deliver them to both ends
    pub fn generate(&self, count: usize) -> Vec<Psk> {
        let keys = self.random_keys(count);
        self.ingest(keys.clone());
        keys
    }

    /// Deliver `keys` to both ends
    pub fn ingest(&self, keys: Vec<Psk>) {
        debug!(
            left = %self.left.site_from(),
            right = %self.right.site_from(),
            count = keys.len(),
            "Delivering keys"
        );
        self.left.ingest(keys.clone());
        self.right.ingest(keys);
    }

    /// Deliver `count` keys whose bytes differ between the two ends, as a
    /// faulty link would
    pub fn ingest_mismatched(&self, count: usize) {
        self.left.ingest(self.random_keys(count));
        self.right.ingest(self.random_keys(count));
    }
}
