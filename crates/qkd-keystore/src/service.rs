//! The peer-facing surface of a site and how to reach other sites

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::backing::BackingStore;
use crate::config::KeyStoreOptions;
use crate::error::{KeyStoreError, Result};
use crate::factory::KeyStoreFactory;
use crate::types::{
    CombinedKeyRequest, CombinedKeyResponse, KeyId, KeyPathRequest, KeyRequest, MarkedKey,
    SharedKey,
};

/// Operations a site agent offers to consumers and to other sites
#[async_trait]
pub trait KeyFactoryService: Send + Sync {
    /// Hand a key shared with `request.site_to` to a local consumer
    async fn get_shared_key(&self, request: KeyRequest) -> Result<SharedKey>;

    /// Reserve `key_id` for the caller at `site_to`, or an alternative if it
    /// is already taken here
    async fn mark_key_in_use(&self, site_to: &str, key_id: KeyId) -> Result<MarkedKey>;

    /// Build the relayed key at the terminal site of `request.sites`
    async fn build_xor_key(&self, request: KeyPathRequest) -> Result<()>;

    /// XOR of the keys this hop shares with its left and right neighbours
    async fn get_combined_key(&self, request: CombinedKeyRequest) -> Result<CombinedKeyResponse>;

    /// Names of the key stores this site holds
    async fn get_key_stores(&self) -> Result<Vec<String>>;
}

/// Opens a channel to another site
pub trait SiteConnector: Send + Sync {
    /// Channels may be lazy: connecting succeeds even if the site is not up
    /// yet and calls fail with `Unavailable` until it is.
    fn connect(&self, address: &str) -> Result<Arc<dyn KeyFactoryService>>;
}

#[derive(Default)]
struct Registry {
    sites: DashMap<String, Weak<dyn KeyFactoryService>>,
    offline: DashSet<String>,
}

/// Sites wired together inside one process.
///
/// Sites are held weakly, so dropping the last handle to a factory takes it
/// off the network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Registry>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&self, address: impl Into<String>, site: &Arc<S>)
    where
        S: KeyFactoryService + 'static,
    {
        let weak = Arc::downgrade(site);
        let weak: Weak<dyn KeyFactoryService> = weak;
        self.registry.sites.insert(address.into(), weak);
    }

    /// Create a factory for `address` that uses this network and join it
    pub fn add_site(
        &self,
        address: &str,
        backing_store: Option<Arc<dyn BackingStore>>,
        options: KeyStoreOptions,
    ) -> Arc<KeyStoreFactory> {
        let factory = KeyStoreFactory::new(address, Arc::new(self.clone()), backing_store, options);
        self.register(address, &factory);
        factory
    }

    /// Make calls to `address` fail as if the site were unreachable
    pub fn set_online(&self, address: &str, online: bool) {
        if online {
            self.registry.offline.remove(address);
        } else {
            self.registry.offline.insert(address.to_string());
        }
    }
}

impl SiteConnector for LocalNetwork {
    fn connect(&self, address: &str) -> Result<Arc<dyn KeyFactoryService>> {
        debug!(address, "Opening local channel");
        Ok(Arc::new(LocalChannel {
            registry: self.registry.clone(),
            address: address.to_string(),
        }))
    }
}

/// Lazily bound handle to a site on a [`LocalNetwork`]
struct LocalChannel {
    registry: Arc<Registry>,
    address: String,
}

impl LocalChannel {
    fn target(&self) -> Result<Arc<dyn KeyFactoryService>> {
        let unreachable =
            || KeyStoreError::Unavailable(format!("Site {} is not reachable", self.address));

        if self.registry.offline.contains(&self.address) {
            return Err(unreachable());
        }
        self.registry
            .sites
            .get(&self.address)
            .and_then(|site| site.value().upgrade())
            .ok_or_else(unreachable)
    }
}

#[async_trait]
impl KeyFactoryService for LocalChannel {
    async fn get_shared_key(&self, request: KeyRequest) -> Result<SharedKey> {
        self.target()?.get_shared_key(request).await
    }

    async fn mark_key_in_use(&self, site_to: &str, key_id: KeyId) -> Result<MarkedKey> {
        self.target()?.mark_key_in_use(site_to, key_id).await
    }

    async fn build_xor_key(&self, request: KeyPathRequest) -> Result<()> {
        self.target()?.build_xor_key(request).await
    }

    async fn get_combined_key(&self, request: CombinedKeyRequest) -> Result<CombinedKeyResponse> {
        self.target()?.get_combined_key(request).await
    }

    async fn get_key_stores(&self) -> Result<Vec<String>> {
        self.target()?.get_key_stores().await
    }
}
