use std::collections::BTreeMap;

use dashmap::DashMap;

use super::{BackingStore, BackingStoreCounts};
use crate::error::Result;
use crate::types::{KeyId, Psk};

#[derive(Default)]
struct LinkKeys {
    /// key id -> (key, in use)
    keys: BTreeMap<KeyId, (Psk, bool)>,
    next_key_id: KeyId,
}

/// Backing store that lives in process memory. Useful for tests and for
/// sites that want an unbounded cache without a file on disk.
#[derive(Default)]
pub struct MemoryBackingStore {
    links: DashMap<String, LinkKeys>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackingStore for MemoryBackingStore {
    fn store_keys(&self, destination: &str, keys: &mut Vec<(KeyId, Psk)>) -> Result<()> {
        let mut link = self.links.entry(destination.to_string()).or_default();

        let pending = std::mem::take(keys);
        for (key_id, key) in pending {
            if link.keys.contains_key(&key_id) {
                keys.push((key_id, key));
                continue;
            }
            link.next_key_id = link.next_key_id.max(key_id + 1);
            link.keys.insert(key_id, (key, false));
        }
        Ok(())
    }

    fn remove_key(&self, destination: &str, key_id: KeyId) -> Result<Option<Psk>> {
        Ok(self
            .links
            .get_mut(destination)
            .and_then(|mut link| link.keys.remove(&key_id))
            .map(|(key, _)| key))
    }

    fn remove_keys(&self, destination: &str, key_ids: &[KeyId]) -> Result<Vec<(KeyId, Psk)>> {
        let Some(mut link) = self.links.get_mut(destination) else {
            return Ok(Vec::new());
        };

        Ok(key_ids
            .iter()
            .filter_map(|id| link.keys.remove(id).map(|(key, _)| (*id, key)))
            .collect())
    }

    fn reserve_key(&self, destination: &str) -> Result<Option<KeyId>> {
        let Some(mut link) = self.links.get_mut(destination) else {
            return Ok(None);
        };

        let candidate = link
            .keys
            .iter_mut()
            .find(|(_, (_, in_use))| !*in_use)
            .map(|(id, (_, in_use))| {
                *in_use = true;
                *id
            });
        Ok(candidate)
    }

    fn counts(&self, destination: &str) -> Result<BackingStoreCounts> {
        let available = self
            .links
            .get(destination)
            .map(|link| link.keys.values().filter(|(_, in_use)| !in_use).count() as u64)
            .unwrap_or(0);

        Ok(BackingStoreCounts {
            available,
            remaining_capacity: u64::MAX,
        })
    }

    fn next_key_id(&self, destination: &str) -> Result<KeyId> {
        Ok(self
            .links
            .get(destination)
            .map(|link| link.next_key_id)
            .filter(|id| *id > 0)
            .unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ids: &[KeyId]) -> Vec<(KeyId, Psk)> {
        ids.iter().map(|id| (*id, Psk::new(vec![*id as u8; 4]))).collect()
    }

    #[test]
    fn test_store_and_remove() {
        let store = MemoryBackingStore::new();
        let mut batch = keys(&[3, 4, 5]);
        store.store_keys("site-b", &mut batch).unwrap();
        assert!(batch.is_empty());
        assert_eq!(store.counts("site-b").unwrap().available, 3);
        assert_eq!(store.next_key_id("site-b").unwrap(), 6);

        let key = store.remove_key("site-b", 4).unwrap().unwrap();
        assert_eq!(key.as_bytes(), &[4, 4, 4, 4]);
        assert!(store.remove_key("site-b", 4).unwrap().is_none());
        assert!(store.remove_key("site-c", 3).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_ids_stay_with_caller() {
        let store = MemoryBackingStore::new();
        store.store_keys("site-b", &mut keys(&[1, 2])).unwrap();

        let mut batch = keys(&[2, 3]);
        store.store_keys("site-b", &mut batch).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, 2);
    }

    #[test]
    fn test_reserve_picks_lowest_unused() {
        let store = MemoryBackingStore::new();
        store.store_keys("site-b", &mut keys(&[7, 9, 8])).unwrap();

        assert_eq!(store.reserve_key("site-b").unwrap(), Some(7));
        assert_eq!(store.reserve_key("site-b").unwrap(), Some(8));
        assert_eq!(store.counts("site-b").unwrap().available, 1);

        // reserved keys can still be removed by id
        assert!(store.remove_key("site-b", 7).unwrap().is_some());
        assert_eq!(store.reserve_key("site-b").unwrap(), Some(9));
        assert_eq!(store.reserve_key("site-b").unwrap(), None);
    }

    #[test]
    fn test_remove_keys_skips_missing() {
        let store = MemoryBackingStore::new();
        store.store_keys("site-b", &mut keys(&[1, 2, 3])).unwrap();
        let removed = store.remove_keys("site-b", &[1, 3, 5]).unwrap();
        let ids: Vec<KeyId> = removed.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
