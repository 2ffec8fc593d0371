//! QKD Key Store Library
//!
//! Buffers pre-shared keys produced by quantum key distribution links and
//! hands them out to consumers at either end of a link.
//!
//! - [`KeyStore`] holds the keys one site shares with one other site and
//!   agrees with the peer on which key id is used, so no key is ever handed
//!   out twice.
//! - [`KeyStoreFactory`] owns every key store of a site, answers the other
//!   sites' agents and builds keys between sites without a direct link by
//!   XOR-ing keys along a path of trusted hops.
//! - [`BackingStore`] takes keys that overflow a key store's cache.

pub mod backing;
pub mod config;
pub mod error;
pub mod factory;
pub mod keystore;
pub mod link;
pub mod resolver;
pub mod service;
pub mod stats;
pub mod types;

pub use backing::{BackingStore, BackingStoreCounts, BackingStoreFactory, MemoryBackingStore};
#[cfg(feature = "sqlite")]
pub use backing::SqliteBackingStore;
pub use config::{KeyStoreOptions, ScenarioConfig, SiteConfig};
pub use error::{KeyStoreError, Result, StatusCode};
pub use factory::{key_locator, KeyStoreFactory};
pub use keystore::KeyStore;
pub use link::KeyLink;
pub use resolver::{SiteResolver, SystemResolver};
pub use service::{KeyFactoryService, LocalNetwork, SiteConnector};
pub use stats::{KeyStoreStats, StatsReporter, StatsSnapshot};
pub use types::*;
