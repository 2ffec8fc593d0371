//! Per site registry of key stores and the relay protocol between sites

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, error, info, trace, warn};

use crate::backing::{BackingStore, BackingStoreFactory};
use crate::config::{KeyStoreOptions, SiteConfig};
use crate::error::{KeyStoreError, Result};
use crate::keystore::KeyStore;
use crate::resolver::{keystore_name, SiteResolver, SystemResolver};
use crate::service::{KeyFactoryService, SiteConnector};
use crate::stats::StatsReporter;
use crate::types::{
    CombinedKeyRequest, CombinedKeyResponse, KeyId, KeyPathRequest, KeyRequest, MarkedKey,
    SharedKey,
};

/// Characters left as they are in a key locator
const LOCATOR_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// PKCS#11 style locator for a key, built from the destination and id only
pub fn key_locator(destination: &str, key_id: KeyId) -> String {
    format!(
        "pkcs11:type=secret-key;object={};id=0x{:02X}",
        utf8_percent_encode(destination, LOCATOR_ESCAPE),
        key_id
    )
}

/// All key stores held by one site, one per destination.
///
/// Serves the site's consumers and the other sites' agents. Key stores are
/// created on first use and live as long as the factory.
pub struct KeyStoreFactory {
    site_address: String,
    site_socket: Option<SocketAddr>,
    /// Canonical name of this site
    site_name: String,
    options: KeyStoreOptions,
    keystores: DashMap<String, Arc<KeyStore>>,
    other_sites: DashMap<String, Arc<dyn KeyFactoryService>>,
    connector: Arc<dyn SiteConnector>,
    resolver: Arc<dyn SiteResolver>,
    backing_store: Option<Arc<dyn BackingStore>>,
    reporters: RwLock<Vec<Arc<dyn StatsReporter>>>,
    this: Weak<KeyStoreFactory>,
}

impl KeyStoreFactory {
    pub fn new(
        site_address: impl Into<String>,
        connector: Arc<dyn SiteConnector>,
        backing_store: Option<Arc<dyn BackingStore>>,
        options: KeyStoreOptions,
    ) -> Arc<Self> {
        Self::with_resolver(
            site_address,
            connector,
            backing_store,
            options,
            Arc::new(SystemResolver::new()),
        )
    }

    pub fn with_resolver(
        site_address: impl Into<String>,
        connector: Arc<dyn SiteConnector>,
        backing_store: Option<Arc<dyn BackingStore>>,
        options: KeyStoreOptions,
        resolver: Arc<dyn SiteResolver>,
    ) -> Arc<Self> {
        let site_address = site_address.into();
        let site_socket = resolver.resolve(&site_address);
        let site_name = keystore_name(resolver.as_ref(), None, &site_address);
        info!(site = %site_address, name = %site_name, "Creating key store factory");

        Arc::new_cyclic(|this| Self {
            site_address,
            site_socket,
            site_name,
            options,
            keystores: DashMap::new(),
            other_sites: DashMap::new(),
            connector,
            resolver,
            backing_store,
            reporters: RwLock::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Build a site from its configuration, creating the stores for its
    /// neighbours and relayed destinations
    pub fn from_config(
        config: &SiteConfig,
        connector: Arc<dyn SiteConnector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let backing_store = BackingStoreFactory::create(&config.backing_store)?;
        let resolver = Arc::new(SystemResolver::with_local_addresses(
            config.local_addresses.clone(),
        ));
        let factory = Self::with_resolver(
            config.site_address.clone(),
            connector,
            backing_store,
            config.keystore,
            resolver,
        );

        for neighbour in &config.neighbours {
            factory.require_key_store(neighbour)?;
        }
        for (destination, hops) in &config.paths {
            factory.require_key_store(destination)?.set_path(hops.clone());
        }
        Ok(factory)
    }

    pub fn site_address(&self) -> &str {
        &self.site_address
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    fn keystore_name(&self, destination: &str) -> String {
        keystore_name(self.resolver.as_ref(), self.site_socket, destination)
    }

    /// Key store for `destination`, created if needed. `None` if the
    /// destination is this site.
    pub fn get_key_store(&self, destination: &str) -> Option<Arc<KeyStore>> {
        let name = self.keystore_name(destination);
        if let Some(store) = self.keystores.get(&name) {
            return Some(store.value().clone());
        }

        if name == self.site_name {
            error!(site = %self.site_address, "Refusing to create a key store for this site");
            return None;
        }

        let store = self
            .keystores
            .entry(name)
            .or_insert_with(|| self.create_key_store(destination))
            .value()
            .clone();
        Some(store)
    }

    fn require_key_store(&self, destination: &str) -> Result<Arc<KeyStore>> {
        self.get_key_store(destination).ok_or_else(|| {
            KeyStoreError::InvalidArgument(format!("No key store available for {}", destination))
        })
    }

    fn create_key_store(&self, destination: &str) -> Arc<KeyStore> {
        let mut store = KeyStore::new(&self.site_address, destination, self.options)
            .with_factory(self.this.clone());

        match self.site_channel(destination) {
            Ok(partner) => store = store.with_partner(partner),
            Err(e) => error!(destination, error = %e, "Failed to connect to other site agent"),
        }
        if let Some(backing_store) = &self.backing_store {
            store = store.with_backing_store(backing_store.clone());
        }

        let reporters = self.reporters.read().unwrap_or_else(PoisonError::into_inner);
        for reporter in reporters.iter() {
            store.stats().add_reporter(reporter.clone());
        }

        info!(site = %self.site_address, destination, "Created key store");
        Arc::new(store)
    }

    /// Channel to the agent at `address`, opened on first use
    fn site_channel(&self, address: &str) -> Result<Arc<dyn KeyFactoryService>> {
        if let Some(channel) = self.other_sites.get(address) {
            return Ok(channel.value().clone());
        }

        let channel = self.connector.connect(address)?;
        Ok(self
            .other_sites
            .entry(address.to_string())
            .or_insert(channel)
            .value()
            .clone())
    }

    pub fn add_reporting_callback(&self, reporter: Arc<dyn StatsReporter>) {
        {
            let mut reporters = self.reporters.write().unwrap_or_else(PoisonError::into_inner);
            if reporters.iter().any(|r| Arc::ptr_eq(r, &reporter)) {
                return;
            }
            reporters.push(reporter.clone());
        }
        for store in self.keystores.iter() {
            store.stats().add_reporter(reporter.clone());
        }
    }

    pub fn remove_reporting_callback(&self, reporter: &Arc<dyn StatsReporter>) {
        self.reporters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| !Arc::ptr_eq(r, reporter));
        for store in self.keystores.iter() {
            store.stats().remove_reporter(reporter);
        }
    }

    /// Shut down every key store, waking anything blocked on them
    pub fn shutdown(&self) {
        info!(site = %self.site_address, "Shutting down key stores");
        for store in self.keystores.iter() {
            store.shutdown();
        }
    }

    /// Runs at the terminal site of a relay. Walks the path back from this
    /// site to the origin, folding in each hop's combined key, then stores
    /// the result under the id the origin shares with the first hop.
    async fn build_relayed_key(&self, request: &KeyPathRequest) -> Result<()> {
        let sites = &request.sites;
        let count = sites.len();
        let terminal_matches = sites
            .last()
            .is_some_and(|last| self.keystore_name(last) == self.site_name);
        if count <= 2 || !terminal_matches {
            return Err(KeyStoreError::InvalidArgument(format!(
                "Invalid key path: {}",
                sites.join(" -> ")
            )));
        }

        let origin = &sites[0];
        let neighbour = &sites[count - 2];
        let neighbour_store = self.require_key_store(neighbour)?;

        let (mut right_key_id, mut relayed) = neighbour_store.get_new_key(true).await.map_err(|e| {
            error!(neighbour = %neighbour, error = %e, "Failed to get a key for the last hop");
            e
        })?;
        debug!(
            key_id = right_key_id,
            neighbour = %neighbour,
            origin = %origin,
            "Starting key relay"
        );

        for middle in (1..count - 1).rev() {
            let hop = &sites[middle];
            let left_site = &sites[middle - 1];
            let right_site = &sites[middle + 1];
            let left_key_id = (middle == 1).then_some(request.originating_key_id);

            let combined = self
                .site_channel(hop)?
                .get_combined_key(CombinedKeyRequest {
                    left_site: left_site.clone(),
                    left_key_id,
                    right_site: right_site.clone(),
                    right_key_id,
                })
                .await;

            let combined = match combined {
                Ok(combined) => combined,
                Err(e) => {
                    warn!(
                        hop = %hop,
                        key_id = right_key_id,
                        error = %e,
                        "Combined key request failed, relay abandoned"
                    );
                    neighbour_store.stats().add_discarded(1);
                    return Err(e);
                }
            };

            trace!(
                hop = %hop,
                left_id = combined.left_id,
                right_id = right_key_id,
                "Folding in combined key"
            );
            relayed.xor_with(&combined.combined_key)?;
            right_key_id = combined.left_id;
        }

        let origin_store = self.require_key_store(origin)?;
        origin_store
            .store_reserved_key(request.originating_key_id, relayed)
            .map_err(|e| {
                error!(
                    origin = %origin,
                    key_id = request.originating_key_id,
                    error = %e,
                    "Failed to store relayed key"
                );
                KeyStoreError::AlreadyExists(
                    "Originating key ID already exists in key store".into(),
                )
            })?;

        info!(
            origin = %origin,
            key_id = request.originating_key_id,
            hops = count - 2,
            "Relayed key stored"
        );
        Ok(())
    }
}

#[async_trait]
impl KeyFactoryService for KeyStoreFactory {
    async fn get_shared_key(&self, request: KeyRequest) -> Result<SharedKey> {
        let name = self.keystore_name(&request.site_to);
        let store = self
            .keystores
            .get(&name)
            .map(|store| store.value().clone())
            .ok_or_else(|| {
                KeyStoreError::InvalidArgument(format!(
                    "No key store available for {} -> {}",
                    self.site_address, request.site_to
                ))
            })?;

        let (key_id, key_value) = match request.key_id {
            Some(key_id) => (key_id, store.get_existing_key(key_id).await?),
            None => store.get_new_key(true).await?,
        };

        let url = key_locator(&request.site_to, key_id);
        trace!(url = %url, "Key ready");
        Ok(SharedKey {
            key_id,
            key_value,
            url,
        })
    }

    async fn mark_key_in_use(&self, site_to: &str, key_id: KeyId) -> Result<MarkedKey> {
        let store = self.get_key_store(site_to).ok_or_else(|| {
            KeyStoreError::InvalidArgument(format!(
                "Unknown key store path: {} -> {}",
                self.site_address, site_to
            ))
        })?;
        store.mark_key_in_use(key_id).await
    }

    async fn build_xor_key(&self, request: KeyPathRequest) -> Result<()> {
        self.build_relayed_key(&request).await
    }

    async fn get_combined_key(&self, request: CombinedKeyRequest) -> Result<CombinedKeyResponse> {
        let left_store = self.require_key_store(&request.left_site)?;
        let right_store = self.require_key_store(&request.right_site)?;

        let (left_id, mut combined_key) = match request.left_key_id {
            Some(key_id) => (key_id, left_store.get_existing_key(key_id).await?),
            None => left_store.get_new_key(true).await.map_err(|e| {
                error!(left = %request.left_site, error = %e, "Failed to get left key");
                e
            })?,
        };

        let right_key = match right_store.get_existing_key(request.right_key_id).await {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    left_id,
                    right_id = request.right_key_id,
                    right = %request.right_site,
                    error = %e,
                    "Right key missing, left key discarded"
                );
                left_store.stats().add_discarded(1);
                return Err(e);
            }
        };

        combined_key.xor_with(&right_key)?;
        debug!(left_id, right_id = request.right_key_id, "Combined keys");
        Ok(CombinedKeyResponse {
            combined_key,
            left_id,
        })
    }

    async fn get_key_stores(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.keystores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }
}
