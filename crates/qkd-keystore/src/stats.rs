//! Per key store counters and the reporting hook

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a key store's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Keys delivered by the generator
    pub key_generated: u64,
    /// Keys handed to consumers
    pub key_used: u64,
    /// Unused keys in memory and in the backing store
    pub unused_keys_available: u64,
    pub reserved_keys: u64,
    /// Keys dropped without being handed out
    pub keys_discarded: u64,
}

/// Receives a snapshot every time a key store's counters change
pub trait StatsReporter: Send + Sync {
    fn report(&self, site_from: &str, site_to: &str, stats: &StatsSnapshot);
}

#[derive(Default)]
pub struct KeyStoreStats {
    key_generated: AtomicU64,
    key_used: AtomicU64,
    unused_keys_available: AtomicU64,
    reserved_keys: AtomicU64,
    keys_discarded: AtomicU64,
    reporters: RwLock<Vec<Arc<dyn StatsReporter>>>,
}

impl KeyStoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_generated(&self, count: u64) {
        self.key_generated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_used(&self, count: u64) {
        self.key_used.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_discarded(&self, count: u64) {
        self.keys_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_unused(&self, count: u64) {
        self.unused_keys_available.store(count, Ordering::Relaxed);
    }

    pub fn set_reserved(&self, count: u64) {
        self.reserved_keys.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            key_generated: self.key_generated.load(Ordering::Relaxed),
            key_used: self.key_used.load(Ordering::Relaxed),
            unused_keys_available: self.unused_keys_available.load(Ordering::Relaxed),
            reserved_keys: self.reserved_keys.load(Ordering::Relaxed),
            keys_discarded: self.keys_discarded.load(Ordering::Relaxed),
        }
    }

    pub fn add_reporter(&self, reporter: Arc<dyn StatsReporter>) {
        let mut reporters = self.reporters.write().unwrap_or_else(PoisonError::into_inner);
        if !reporters.iter().any(|r| Arc::ptr_eq(r, &reporter)) {
            reporters.push(reporter);
        }
    }

    pub fn remove_reporter(&self, reporter: &Arc<dyn StatsReporter>) {
        self.reporters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| !Arc::ptr_eq(r, reporter));
    }

    /// Push the current snapshot to every reporter
    pub fn publish(&self, site_from: &str, site_to: &str) {
        let reporters = self.reporters.read().unwrap_or_else(PoisonError::into_inner);
        if reporters.is_empty() {
            return;
        }

        let snapshot = self.snapshot();
        for reporter in reporters.iter() {
            reporter.report(site_from, site_to, &snapshot);
        }
    }
}
