//! Overflow persistence for key stores
//!
//! A key store keeps at most `cache_threshold` unused keys in memory. Keys
//! beyond that are pushed to a [`BackingStore`], and are pulled back out when
//! they are reserved or requested by id. Implementations are called while the
//! owning key store holds its lock, so every method is synchronous and should
//! return promptly.

use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::{KeyStoreError, Result};
use crate::types::{KeyId, Psk};

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryBackingStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackingStore;

/// File name used when a `file:` url does not name one
pub const DEFAULT_FILENAME: &str = "keys.db";

/// Number of keys held for a destination and how many more fit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingStoreCounts {
    pub available: u64,
    pub remaining_capacity: u64,
}

/// Persistent store for keys that do not fit in a key store's cache.
///
/// Keys are namespaced by destination site. Ids are unique per destination.
pub trait BackingStore: Send + Sync {
    /// Move `keys` into the store. Keys that were stored are removed from
    /// `keys`; anything left behind was not accepted and stays with the
    /// caller. On `Err` none of the keys were stored.
    fn store_keys(&self, destination: &str, keys: &mut Vec<(KeyId, Psk)>) -> Result<()>;

    /// Remove and return one key
    fn remove_key(&self, destination: &str, key_id: KeyId) -> Result<Option<Psk>>;

    /// Remove and return every key in `key_ids` that the store holds
    fn remove_keys(&self, destination: &str, key_ids: &[KeyId]) -> Result<Vec<(KeyId, Psk)>>;

    /// Atomically pick an unused key and mark it in use. The key stays in the
    /// store until it is removed.
    fn reserve_key(&self, destination: &str) -> Result<Option<KeyId>>;

    fn counts(&self, destination: &str) -> Result<BackingStoreCounts>;

    /// The id after the highest one ever stored for `destination`, or 1
    fn next_key_id(&self, destination: &str) -> Result<KeyId>;
}

/// Builds a backing store from a url
pub struct BackingStoreFactory;

impl BackingStoreFactory {
    /// * `""` - no backing store
    /// * `memory:` - process memory
    /// * `file:///path/keys.db`, `file:keys.db` - SQLite file, [`DEFAULT_FILENAME`] when empty
    pub fn create(url: &str) -> Result<Option<Arc<dyn BackingStore>>> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(None);
        }

        let parsed = Url::parse(url).map_err(|e| {
            KeyStoreError::InvalidArgument(format!("Invalid backing store url {}: {}", url, e))
        })?;

        match parsed.scheme() {
            "memory" => {
                info!("Using in-memory backing store");
                Ok(Some(Arc::new(MemoryBackingStore::new())))
            }
            #[cfg(feature = "sqlite")]
            "file" => {
                let path = file_path(url, &parsed);
                info!(path = %path, "Using SQLite backing store");
                Ok(Some(Arc::new(SqliteBackingStore::open(&path)?)))
            }
            other => Err(KeyStoreError::InvalidArgument(format!(
                "Unsupported backing store: {}",
                other
            ))),
        }
    }
}

/// File name named by a `file:` url. Without a `//` authority the rest of
/// the url is a path relative to the working directory.
#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
fn file_path(raw: &str, url: &Url) -> String {
    let joined = match raw.strip_prefix("file:") {
        Some(rest) if !rest.starts_with("//") => {
            percent_decode_str(rest).decode_utf8_lossy().into_owned()
        }
        _ => {
            let host = url.host_str().unwrap_or_default();
            let path = match url.path() {
                "/" => String::new(),
                path => percent_decode_str(path).decode_utf8_lossy().into_owned(),
            };
            format!("{}{}", host, path)
        }
    };

    if joined.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_url_has_no_store() {
        assert!(BackingStoreFactory::create("").unwrap().is_none());
        assert!(BackingStoreFactory::create("  ").unwrap().is_none());
    }

    #[test]
    fn test_memory_url() {
        let store = BackingStoreFactory::create("memory:").unwrap().unwrap();
        assert_eq!(store.next_key_id("site").unwrap(), 1);
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let result = BackingStoreFactory::create("redis://localhost");
        assert!(matches!(result, Err(KeyStoreError::InvalidArgument(_))));
    }

    fn path_of(raw: &str) -> String {
        file_path(raw, &Url::parse(raw).unwrap())
    }

    #[test]
    fn test_file_path_forms() {
        assert_eq!(path_of("file:///var/lib/qkd/keys.db"), "/var/lib/qkd/keys.db");
        assert_eq!(path_of("file://store.db"), "store.db");
        assert_eq!(path_of("file:"), DEFAULT_FILENAME);
        assert_eq!(path_of("file:///tmp/my%20keys.db"), "/tmp/my keys.db");

        // no authority: relative to the working directory
        assert_eq!(path_of("file:keys.db"), "keys.db");
        assert_eq!(path_of("file:data/site%20a.db"), "data/site a.db");
        assert_eq!(path_of("file:/srv/keys.db"), "/srv/keys.db");
    }
}
