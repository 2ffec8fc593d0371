//! Key buffer for one ordered pair of sites
//!
//! Both ends of a key link ingest the same stream of keys and number them
//! identically. Before a key is handed out, the two ends agree on which id is
//! being used through `mark_key_in_use`, so that concurrent requests from
//! either side never receive the same key twice.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::backing::BackingStore;
use crate::config::KeyStoreOptions;
use crate::error::{KeyStoreError, Result};
use crate::factory::KeyStoreFactory;
use crate::service::KeyFactoryService;
use crate::stats::{KeyStoreStats, StatsSnapshot};
use crate::types::{KeyDigest, KeyId, KeyPathRequest, MarkedKey, Psk};

#[derive(Default)]
struct StoreState {
    unused: BTreeMap<KeyId, Psk>,
    /// Reserved keys. An empty key is a placeholder for an id the peer has
    /// claimed before it was generated here.
    reserved: BTreeMap<KeyId, Psk>,
    /// Hops to the destination when there is no direct link
    path: Vec<String>,
}

enum Waited<T> {
    Ready(T),
    TimedOut,
    Shutdown,
}

/// Progress of a direct key allocation
#[derive(Debug)]
pub(crate) enum AllocationState {
    Idle,
    Reserving,
    Negotiating { candidate: KeyId },
    AwaitingAlternative { candidate: KeyId, alternative: MarkedKey },
    Fulfilled { key_id: KeyId, key: Psk },
    Failed(KeyStoreError),
}

impl AllocationState {
    fn name(&self) -> &'static str {
        match self {
            AllocationState::Idle => "idle",
            AllocationState::Reserving => "reserving",
            AllocationState::Negotiating { .. } => "negotiating",
            AllocationState::AwaitingAlternative { .. } => "awaiting-alternative",
            AllocationState::Fulfilled { .. } => "fulfilled",
            AllocationState::Failed(_) => "failed",
        }
    }
}

/// Keys shared between `site_from` and `site_to`
pub struct KeyStore {
    site_from: String,
    site_to: String,
    state: Mutex<StoreState>,
    changed: Notify,
    shutdown: AtomicBool,
    next_key_id: AtomicU64,
    cache_threshold: u64,
    wait_timeout: Duration,
    backing_store: Option<Arc<dyn BackingStore>>,
    /// Agent at `site_to`
    partner: Option<Arc<dyn KeyFactoryService>>,
    factory: Weak<KeyStoreFactory>,
    stats: KeyStoreStats,
}

impl KeyStore {
    pub fn new(
        site_from: impl Into<String>,
        site_to: impl Into<String>,
        options: KeyStoreOptions,
    ) -> Self {
        Self {
            site_from: site_from.into(),
            site_to: site_to.into(),
            state: Mutex::new(StoreState::default()),
            changed: Notify::new(),
            shutdown: AtomicBool::new(false),
            next_key_id: AtomicU64::new(1),
            cache_threshold: options.cache_threshold,
            wait_timeout: options.wait_timeout(),
            backing_store: None,
            partner: None,
            factory: Weak::new(),
            stats: KeyStoreStats::new(),
        }
    }

    /// Overflow to `backing_store` and continue numbering after the keys it
    /// already holds
    pub fn with_backing_store(mut self, backing_store: Arc<dyn BackingStore>) -> Self {
        match backing_store.next_key_id(&self.site_to) {
            Ok(next) => self.next_key_id = AtomicU64::new(next.max(1)),
            Err(e) => error!(
                destination = %self.site_to,
                error = %e,
                "Failed to read next key id from backing store"
            ),
        }
        self.backing_store = Some(backing_store);
        self
    }

    pub fn with_partner(mut self, partner: Arc<dyn KeyFactoryService>) -> Self {
        self.partner = Some(partner);
        self
    }

    pub(crate) fn with_factory(mut self, factory: Weak<KeyStoreFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn site_from(&self) -> &str {
        &self.site_from
    }

    pub fn site_to(&self) -> &str {
        &self.site_to
    }

    pub fn stats(&self) -> &KeyStoreStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Id the next ingested key will receive
    pub fn next_key_id(&self) -> KeyId {
        self.next_key_id.load(Ordering::SeqCst)
    }

    pub fn unused_count(&self) -> usize {
        self.lock().unused.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().reserved.len()
    }

    pub fn path(&self) -> Vec<String> {
        self.lock().path.clone()
    }

    /// Route keys for this destination through `hops` when no direct key is
    /// available
    pub fn set_path(&self, hops: Vec<String>) {
        debug!(destination = %self.site_to, path = %hops.join(" -> "), "Setting key path");
        self.lock().path = hops;
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Add keys from the generator. Each key takes the next id in sequence.
    ///
    /// An id whose slot already holds a key, such as a relayed key deposited
    /// with [`store_reserved_key`](Self::store_reserved_key), keeps that key
    /// and the generated one is discarded.
    pub fn ingest(&self, keys: Vec<Psk>) {
        trace!(destination = %self.site_to, count = keys.len(), "Adding keys");

        let mut stored = 0u64;
        let mut discarded = 0u64;
        let mut overflow = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            for key in keys {
                if key.is_empty() {
                    // would be taken for a placeholder, and both ends skip it
                    warn!(destination = %self.site_to, "Skipping empty key from generator");
                    continue;
                }
                let key_id = self.next_key_id.fetch_add(1, Ordering::SeqCst);

                if let Some(slot) = state.reserved.get_mut(&key_id) {
                    if slot.is_empty() {
                        // the peer claimed this id before it arrived here
                        *slot = key;
                        stored += 1;
                    } else {
                        warn!(
                            key_id,
                            destination = %self.site_to,
                            "Reserved key id already holds a key, discarding generated key"
                        );
                        discarded += 1;
                    }
                } else if state.unused.contains_key(&key_id) {
                    warn!(
                        key_id,
                        destination = %self.site_to,
                        "Key id already in use, discarding generated key"
                    );
                    discarded += 1;
                } else if self.backing_store.is_some()
                    && state.unused.len() as u64 >= self.cache_threshold
                {
                    overflow.push((key_id, key));
                    stored += 1;
                } else {
                    state.unused.insert(key_id, key);
                    stored += 1;
                }
            }
        }

        if let Some(backing_store) = &self.backing_store {
            if !overflow.is_empty() {
                if let Err(e) = backing_store.store_keys(&self.site_to, &mut overflow) {
                    warn!(destination = %self.site_to, error = %e, "Backing store rejected keys");
                }
                if !overflow.is_empty() {
                    warn!(
                        destination = %self.site_to,
                        count = overflow.len(),
                        "Failed to send keys to backing store, keeping them in memory"
                    );
                    let mut state = self.lock();
                    state.unused.extend(overflow);
                }
            }
        }

        self.changed.notify_waiters();
        self.stats.add_generated(stored);
        self.stats.add_discarded(discarded);
        self.publish_stats();
    }

    /// Move the lowest unused key to the reserved set
    fn reserve_new_key(&self, state: &mut StoreState) -> Result<Option<KeyId>> {
        if let Some((key_id, key)) = state.unused.pop_first() {
            state.reserved.insert(key_id, key);
            return Ok(Some(key_id));
        }

        let Some(backing_store) = &self.backing_store else {
            return Ok(None);
        };

        if let Some(key_id) = backing_store.reserve_key(&self.site_to)? {
            match backing_store.remove_key(&self.site_to, key_id)? {
                Some(key) => {
                    state.reserved.insert(key_id, key);
                    return Ok(Some(key_id));
                }
                None => {
                    warn!(key_id, destination = %self.site_to, "Backing store lost a reserved key")
                }
            }
        }
        Ok(None)
    }

    fn take_from_backing_store(&self, key_id: KeyId) -> Result<Option<Psk>> {
        match &self.backing_store {
            Some(backing_store) => backing_store.remove_key(&self.site_to, key_id),
            None => Ok(None),
        }
    }

    /// Run `ready` under the lock until it yields a value, the wait times out
    /// or the store shuts down.
    async fn wait_for<T>(
        &self,
        mut ready: impl FnMut(&mut StoreState) -> Result<Option<T>>,
    ) -> Result<Waited<T>> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut expired = false;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // register before checking so a change between the check and the
            // await is not lost
            notified.as_mut().enable();

            if self.is_shutdown() {
                return Ok(Waited::Shutdown);
            }
            {
                let mut guard = self.lock();
                if let Some(value) = ready(&mut guard)? {
                    return Ok(Waited::Ready(value));
                }
            }
            if expired {
                return Ok(Waited::TimedOut);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // one last look before giving up
                expired = true;
            }
        }
    }

    /// Get a key that has not been used before, agreeing its id with the peer.
    ///
    /// Falls back to building a key over the configured path when no direct
    /// key can be had.
    pub fn get_new_key(&self, wait_for_key: bool) -> BoxFuture<'_, Result<(KeyId, Psk)>> {
        async move {
            let has_path = !self.lock().path.is_empty();
            let direct = self.get_new_direct_key(!has_path && wait_for_key).await;

            match direct {
                Err(e) if has_path => {
                    debug!(
                        destination = %self.site_to,
                        error = %e,
                        "No direct key, building one along the path"
                    );
                    self.get_new_indirect_key().await
                }
                other => other,
            }
        }
        .boxed()
    }

    pub(crate) async fn get_new_direct_key(&self, wait_for_key: bool) -> Result<(KeyId, Psk)> {
        let mut state = AllocationState::Idle;
        loop {
            trace!(destination = %self.site_to, state = state.name(), "Direct allocation");
            state = match state {
                AllocationState::Fulfilled { key_id, key } => {
                    self.stats.add_used(1);
                    self.publish_stats();
                    return Ok((key_id, key));
                }
                AllocationState::Failed(e) => return Err(e),
                other => self.advance(other, wait_for_key).await,
            };
        }
    }

    pub(crate) async fn advance(
        &self,
        state: AllocationState,
        wait_for_key: bool,
    ) -> AllocationState {
        match state {
            AllocationState::Idle => match self.partner {
                Some(_) => AllocationState::Reserving,
                None => {
                    error!(destination = %self.site_to, "Key store not connected");
                    AllocationState::Failed(KeyStoreError::Unavailable(format!(
                        "Key store not connected to {}",
                        self.site_to
                    )))
                }
            },
            AllocationState::Reserving => match self.reserve_candidate(wait_for_key).await {
                Ok(candidate) => AllocationState::Negotiating { candidate },
                Err(e) => AllocationState::Failed(e),
            },
            AllocationState::Negotiating { candidate } => self.negotiate(candidate).await,
            AllocationState::AwaitingAlternative { candidate, alternative } => {
                self.take_alternative(candidate, alternative).await
            }
            done @ (AllocationState::Fulfilled { .. } | AllocationState::Failed(_)) => done,
        }
    }

    async fn reserve_candidate(&self, wait_for_key: bool) -> Result<KeyId> {
        let exhausted =
            || KeyStoreError::Exhausted(format!("No key available for {}", self.site_to));

        if !wait_for_key {
            let mut guard = self.lock();
            return self.reserve_new_key(&mut guard)?.ok_or_else(exhausted);
        }

        match self.wait_for(|state| self.reserve_new_key(state)).await? {
            Waited::Ready(key_id) => Ok(key_id),
            Waited::TimedOut => Err(exhausted()),
            Waited::Shutdown => Err(KeyStoreError::Exhausted(format!(
                "Key store for {} is shutting down",
                self.site_to
            ))),
        }
    }

    async fn negotiate(&self, candidate: KeyId) -> AllocationState {
        let Some(partner) = &self.partner else {
            return AllocationState::Failed(KeyStoreError::Unavailable(
                "Key store not connected".into(),
            ));
        };

        match partner.mark_key_in_use(&self.site_from, candidate).await {
            Ok(marked) if marked.key_id == candidate => {
                debug!(key_id = candidate, destination = %self.site_to, "Peer accepted key");
                let key = self.lock().reserved.remove(&candidate);
                match key {
                    Some(key) => self.confirm(candidate, key, marked.digest),
                    None => AllocationState::Failed(KeyStoreError::Internal(format!(
                        "Reserved key {} disappeared",
                        candidate
                    ))),
                }
            }
            Ok(marked) => {
                debug!(
                    key_id = candidate,
                    alternative = marked.key_id,
                    destination = %self.site_to,
                    "Peer reserved an alternative key"
                );
                AllocationState::AwaitingAlternative {
                    candidate,
                    alternative: marked,
                }
            }
            Err(e) => {
                error!(
                    key_id = candidate,
                    destination = %self.site_to,
                    error = %e,
                    "Key allocation failed"
                );
                AllocationState::Failed(e)
            }
        }
    }

    /// Wait for the key the peer picked instead of our candidate. The
    /// candidate stays reserved since the peer is using it for its own request.
    async fn take_alternative(&self, candidate: KeyId, alternative: MarkedKey) -> AllocationState {
        let key_id = alternative.key_id;
        let waited = self
            .wait_for(|state| {
                if let Some(key) = state.unused.remove(&key_id) {
                    return Ok(Some(key));
                }
                if state.reserved.get(&key_id).is_some_and(|key| !key.is_empty()) {
                    return Ok(state.reserved.remove(&key_id));
                }
                self.take_from_backing_store(key_id)
            })
            .await;

        match waited {
            Ok(Waited::Ready(key)) => self.confirm(key_id, key, alternative.digest),
            Ok(_) => {
                error!(
                    key_id,
                    candidate,
                    destination = %self.site_to,
                    "Failed to find alternative key"
                );
                AllocationState::Failed(KeyStoreError::Exhausted(format!(
                    "Failed to find unused key {}. Please retry.",
                    key_id
                )))
            }
            Err(e) => AllocationState::Failed(e),
        }
    }

    /// Only release a key when the peer's copy has the same digest
    fn confirm(&self, key_id: KeyId, key: Psk, remote: KeyDigest) -> AllocationState {
        let local = key.digest();
        if local == remote {
            return AllocationState::Fulfilled { key_id, key };
        }

        warn!(
            key_id,
            destination = %self.site_to,
            local = %local.short(),
            remote = %remote.short(),
            "Key does not match the peer's copy, discarding"
        );
        self.stats.add_discarded(1);
        AllocationState::Failed(KeyStoreError::KeyMismatch { key_id })
    }

    /// Build a key with the destination out of keys shared along the path.
    /// Returns the id of the key shared with the first hop, which the
    /// destination stores the relayed key under.
    async fn get_new_indirect_key(&self) -> Result<(KeyId, Psk)> {
        let path = self.path();
        let factory = self
            .factory
            .upgrade()
            .ok_or_else(|| {
                KeyStoreError::Unavailable("Key store factory has been dropped".into())
            })?;
        let partner = self
            .partner
            .clone()
            .ok_or_else(|| {
                KeyStoreError::Unavailable(format!("No connection to {}", self.site_to))
            })?;

        let mut sites = Vec::with_capacity(path.len() + 2);
        sites.push(self.site_from.clone());
        sites.extend(path);
        sites.push(self.site_to.clone());

        let next_hop = sites[1].clone();
        let hop_store = factory.get_key_store(&next_hop).ok_or_else(|| {
            KeyStoreError::InvalidArgument(format!("No key store for next hop {}", next_hop))
        })?;

        let (key_id, key) = hop_store.get_new_key(true).await.map_err(|e| {
            error!(hop = %next_hop, error = %e, "Failed to get a key for the first hop");
            e
        })?;
        debug!(key_id, hop = %next_hop, destination = %self.site_to, "Building relayed key");

        let request = KeyPathRequest {
            sites,
            originating_key_id: key_id,
        };
        if let Err(e) = partner.build_xor_key(request).await {
            warn!(
                key_id,
                hop = %next_hop,
                destination = %self.site_to,
                error = %e,
                "Key relay failed, first hop key discarded"
            );
            hop_store.stats().add_discarded(1);
            return Err(match e {
                KeyStoreError::Unavailable(_) => e,
                other => KeyStoreError::Internal(format!(
                    "Key relay to {} failed: {}",
                    self.site_to, other
                )),
            });
        }

        self.stats.add_generated(1);
        self.stats.add_used(1);
        self.publish_stats();
        Ok((key_id, key))
    }

    /// Called by the peer: reserve `key_id` for it.
    ///
    /// If the id is already reserved here, a different key is reserved and
    /// its id returned instead. If the key has not been generated yet, wait
    /// for it.
    pub async fn mark_key_in_use(&self, key_id: KeyId) -> Result<MarkedKey> {
        enum Claim {
            Confirmed(KeyDigest),
            Taken,
            Pending,
        }

        let claim = {
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.reserved.contains_key(&key_id) {
                Claim::Taken
            } else if let Some(key) = state.unused.remove(&key_id) {
                let digest = key.digest();
                state.reserved.insert(key_id, key);
                Claim::Confirmed(digest)
            } else if let Some(key) = self.take_from_backing_store(key_id)? {
                let digest = key.digest();
                state.reserved.insert(key_id, key);
                Claim::Confirmed(digest)
            } else {
                state.reserved.insert(key_id, Psk::default());
                Claim::Pending
            }
        };

        match claim {
            Claim::Confirmed(digest) => {
                self.publish_stats();
                Ok(MarkedKey { key_id, digest })
            }
            Claim::Taken => {
                debug!(
                    key_id,
                    destination = %self.site_to,
                    "Key already reserved, offering an alternative"
                );
                self.reserve_alternative().await
            }
            Claim::Pending => {
                trace!(key_id, destination = %self.site_to, "Waiting for key to arrive");
                let filled = self
                    .wait_for(|state| {
                        Ok(state
                            .reserved
                            .get(&key_id)
                            .filter(|key| !key.is_empty())
                            .map(Psk::digest))
                    })
                    .await?;

                match filled {
                    Waited::Ready(digest) => {
                        self.publish_stats();
                        Ok(MarkedKey { key_id, digest })
                    }
                    Waited::Shutdown => Err(KeyStoreError::Unavailable(format!(
                        "Key store for {} is shutting down",
                        self.site_to
                    ))),
                    Waited::TimedOut => {
                        {
                            let mut state = self.lock();
                            if state.reserved.get(&key_id).is_some_and(Psk::is_empty) {
                                state.reserved.remove(&key_id);
                            }
                        }
                        debug!(
                            key_id,
                            destination = %self.site_to,
                            "Key never arrived, offering an alternative"
                        );
                        self.reserve_alternative().await
                    }
                }
            }
        }
    }

    async fn reserve_alternative(&self) -> Result<MarkedKey> {
        let waited = self
            .wait_for(|state| {
                let reserved = self.reserve_new_key(state)?;
                Ok(reserved.and_then(|key_id| {
                    state.reserved.get(&key_id).map(|key| MarkedKey {
                        key_id,
                        digest: key.digest(),
                    })
                }))
            })
            .await?;

        match waited {
            Waited::Ready(marked) => {
                self.publish_stats();
                Ok(marked)
            }
            Waited::TimedOut | Waited::Shutdown => Err(KeyStoreError::Unavailable(
                "Key already reserved, no new keys available".into(),
            )),
        }
    }

    /// Take a reserved key by id, as agreed earlier with the peer
    pub async fn get_existing_key(&self, key_id: KeyId) -> Result<Psk> {
        let waited = self
            .wait_for(|state| {
                if state.reserved.get(&key_id).is_some_and(|key| !key.is_empty()) {
                    return Ok(state.reserved.remove(&key_id));
                }
                self.take_from_backing_store(key_id)
            })
            .await?;

        match waited {
            Waited::Ready(key) => {
                self.stats.add_used(1);
                self.publish_stats();
                Ok(key)
            }
            Waited::TimedOut | Waited::Shutdown => {
                Err(KeyStoreError::NotFound(format!("No key {} found within timeout", key_id)))
            }
        }
    }

    /// Deposit a key under a known id so it can be collected with
    /// [`get_existing_key`](Self::get_existing_key)
    pub fn store_reserved_key(&self, key_id: KeyId, key: Psk) -> Result<()> {
        {
            let mut state = self.lock();
            let occupied = state.unused.contains_key(&key_id)
                || state.reserved.get(&key_id).is_some_and(|k| !k.is_empty());
            if occupied {
                return Err(KeyStoreError::AlreadyExists(format!(
                    "Key {} already exists in key store for {}",
                    key_id, self.site_to
                )));
            }
            state.reserved.insert(key_id, key);
        }

        self.changed.notify_waiters();
        self.publish_stats();
        Ok(())
    }

    /// Move every key held in memory to the backing store
    pub fn flush_cache(&self) {
        let Some(backing_store) = &self.backing_store else {
            return;
        };

        let mut keys = Vec::new();
        let mut reserved_ids = BTreeSet::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            keys.extend(std::mem::take(&mut state.unused));
            for (key_id, key) in std::mem::take(&mut state.reserved) {
                if key.is_empty() {
                    state.reserved.insert(key_id, key);
                } else {
                    reserved_ids.insert(key_id);
                    keys.push((key_id, key));
                }
            }
        }
        if keys.is_empty() {
            return;
        }

        let total = keys.len();
        if let Err(e) = backing_store.store_keys(&self.site_to, &mut keys) {
            error!(destination = %self.site_to, error = %e, "Failed to move keys to backing store");
        }

        if !keys.is_empty() {
            error!(
                destination = %self.site_to,
                count = keys.len(),
                "Keys not accepted by backing store, keeping them in memory"
            );
            let mut state = self.lock();
            for (key_id, key) in keys {
                if reserved_ids.contains(&key_id) {
                    state.reserved.insert(key_id, key);
                } else {
                    state.unused.insert(key_id, key);
                }
            }
        } else {
            info!(destination = %self.site_to, count = total, "Flushed keys to backing store");
        }
    }

    /// Wake every blocked caller and flush to the backing store
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(destination = %self.site_to, "Key store shutting down");
        self.changed.notify_waiters();
        self.flush_cache();
    }

    fn publish_stats(&self) {
        let (unused, reserved) = {
            let state = self.lock();
            (state.unused.len() as u64, state.reserved.len() as u64)
        };
        let stored = self
            .backing_store
            .as_ref()
            .and_then(|backing_store| match backing_store.counts(&self.site_to) {
                Ok(counts) => Some(counts.available),
                Err(e) => {
                    warn!(destination = %self.site_to, error = %e, "Failed to count stored keys");
                    None
                }
            })
            .unwrap_or(0);

        self.stats.set_unused(unused + stored);
        self.stats.set_reserved(reserved);
        self.stats.publish(&self.site_from, &self.site_to);
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemoryBackingStore;
    use crate::types::{
        CombinedKeyRequest, CombinedKeyResponse, KeyRequest, SharedKey,
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn options() -> KeyStoreOptions {
        KeyStoreOptions::default().with_wait_timeout(Duration::from_millis(200))
    }

    fn key(byte: u8) -> Psk {
        Psk::new(vec![byte; 16])
    }

    /// Peer that answers `mark_key_in_use` from a script
    #[derive(Default)]
    struct ScriptedPeer {
        answers: StdMutex<Vec<Result<MarkedKey>>>,
        asked: StdMutex<Vec<KeyId>>,
    }

    impl ScriptedPeer {
        fn answering(answers: Vec<Result<MarkedKey>>) -> Arc<Self> {
            let mut answers = answers;
            answers.reverse();
            Arc::new(Self {
                answers: StdMutex::new(answers),
                asked: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl KeyFactoryService for ScriptedPeer {
        async fn get_shared_key(&self, _request: KeyRequest) -> Result<SharedKey> {
            Err(KeyStoreError::Internal("not scripted".into()))
        }

        async fn mark_key_in_use(&self, _site_to: &str, key_id: KeyId) -> Result<MarkedKey> {
            self.asked.lock().unwrap().push(key_id);
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(KeyStoreError::Internal("script exhausted".into())))
        }

        async fn build_xor_key(&self, _request: KeyPathRequest) -> Result<()> {
            Err(KeyStoreError::Internal("not scripted".into()))
        }

        async fn get_combined_key(
            &self,
            _request: CombinedKeyRequest,
        ) -> Result<CombinedKeyResponse> {
            Err(KeyStoreError::Internal("not scripted".into()))
        }

        async fn get_key_stores(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn accept(key_id: KeyId, key: &Psk) -> Result<MarkedKey> {
        Ok(MarkedKey {
            key_id,
            digest: key.digest(),
        })
    }

    #[tokio::test]
    async fn test_ingest_numbers_keys_in_order() {
        let store = KeyStore::new("a", "b", options());
        store.ingest(vec![key(0xAA), key(0xBB)]);

        assert_eq!(store.next_key_id(), 3);
        assert_eq!(store.unused_count(), 2);
        assert_eq!(store.stats_snapshot().key_generated, 2);
        assert_eq!(store.stats_snapshot().unused_keys_available, 2);
    }

    #[tokio::test]
    async fn test_ingest_keeps_deposited_key() {
        let store = KeyStore::new("c", "a", options());
        store.store_reserved_key(2, key(0x22)).unwrap();
        store.ingest(vec![key(1), key(2), key(3)]);

        assert_eq!(store.unused_count(), 2);
        assert_eq!(store.reserved_count(), 1);
        let stats = store.stats_snapshot();
        assert_eq!(stats.key_generated, 2);
        assert_eq!(stats.keys_discarded, 1);
        assert_eq!(store.get_existing_key(2).await.unwrap(), key(0x22));
    }

    #[tokio::test]
    async fn test_ingest_skips_empty_keys() {
        let store = KeyStore::new("a", "b", options());
        store.ingest(vec![key(1), Psk::default(), key(2)]);

        assert_eq!(store.next_key_id(), 3);
        assert_eq!(store.unused_count(), 2);
        assert_eq!(store.reserved_count(), 0);
        assert_eq!(store.stats_snapshot().key_generated, 2);
    }

    #[tokio::test]
    async fn test_direct_key_agreed_with_peer() {
        let peer = ScriptedPeer::answering(vec![accept(1, &key(0xAA))]);
        let store = KeyStore::new("a", "b", options()).with_partner(peer.clone());
        store.ingest(vec![key(0xAA), key(0xBB)]);

        let (key_id, value) = store.get_new_key(false).await.unwrap();
        assert_eq!(key_id, 1);
        assert_eq!(value, key(0xAA));
        assert_eq!(*peer.asked.lock().unwrap(), vec![1]);
        assert_eq!(store.unused_count(), 1);
        assert_eq!(store.reserved_count(), 0);
        assert_eq!(store.stats_snapshot().key_used, 1);
    }

    #[tokio::test]
    async fn test_no_partner_is_unavailable() {
        let store = KeyStore::new("a", "b", options());
        store.ingest(vec![key(1)]);
        let result = store.get_new_key(false).await;
        assert!(matches!(result, Err(KeyStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_empty_store_is_exhausted() {
        let peer = ScriptedPeer::answering(vec![]);
        let store = KeyStore::new("a", "b", options()).with_partner(peer);

        let result = store.get_new_key(false).await;
        assert!(matches!(result, Err(KeyStoreError::Exhausted(_))));

        let result = store.get_new_key(true).await;
        assert!(matches!(result, Err(KeyStoreError::Exhausted(_))));
    }

    #[tokio::test]
    async fn test_alternative_key_from_peer() {
        // peer already reserved 1 for itself and offers 2
        let peer = ScriptedPeer::answering(vec![accept(2, &key(0xBB))]);
        let store = KeyStore::new("a", "b", options()).with_partner(peer);
        store.ingest(vec![key(0xAA), key(0xBB)]);

        let (key_id, value) = store.get_new_key(false).await.unwrap();
        assert_eq!(key_id, 2);
        assert_eq!(value, key(0xBB));
        // 1 stays reserved for the peer's own request
        assert_eq!(store.reserved_count(), 1);
        assert_eq!(store.get_existing_key(1).await.unwrap(), key(0xAA));
    }

    #[tokio::test]
    async fn test_alternative_that_never_arrives() {
        let peer = ScriptedPeer::answering(vec![accept(9, &key(0x99))]);
        let store = KeyStore::new("a", "b", options()).with_partner(peer);
        store.ingest(vec![key(0xAA)]);

        let result = store.get_new_key(false).await;
        assert!(
            matches!(result, Err(KeyStoreError::Exhausted(msg)) if msg.contains("Please retry"))
        );
    }

    #[tokio::test]
    async fn test_mismatched_digest_discards_key() {
        let peer = ScriptedPeer::answering(vec![accept(1, &key(0x11))]);
        let store = KeyStore::new("a", "b", options()).with_partner(peer);
        store.ingest(vec![key(0xAA)]);

        let result = store.get_new_key(false).await;
        assert!(matches!(result, Err(KeyStoreError::KeyMismatch { key_id: 1 })));
        assert_eq!(store.reserved_count(), 0);
        assert_eq!(store.stats_snapshot().keys_discarded, 1);
    }

    #[tokio::test]
    async fn test_negotiation_error_is_returned() {
        let peer = ScriptedPeer::answering(vec![Err(KeyStoreError::Unavailable("down".into()))]);
        let store = KeyStore::new("a", "b", options()).with_partner(peer);
        store.ingest(vec![key(1)]);

        let result = store.get_new_key(false).await;
        assert!(matches!(result, Err(KeyStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_state_machine_steps() {
        let peer = ScriptedPeer::answering(vec![accept(1, &key(7))]);
        let store = KeyStore::new("a", "b", options()).with_partner(peer);
        store.ingest(vec![key(7)]);

        let state = store.advance(AllocationState::Idle, false).await;
        assert!(matches!(state, AllocationState::Reserving));
        let state = store.advance(state, false).await;
        assert!(matches!(state, AllocationState::Negotiating { candidate: 1 }));
        let state = store.advance(state, false).await;
        assert!(matches!(state, AllocationState::Fulfilled { key_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_mark_unused_key() {
        let store = KeyStore::new("b", "a", options());
        store.ingest(vec![key(0xAA), key(0xBB)]);

        let marked = store.mark_key_in_use(2).await.unwrap();
        assert_eq!(marked.key_id, 2);
        assert_eq!(marked.digest, key(0xBB).digest());
        assert_eq!(store.reserved_count(), 1);
        assert_eq!(store.get_existing_key(2).await.unwrap(), key(0xBB));
    }

    #[tokio::test]
    async fn test_mark_reserved_key_offers_alternative() {
        let store = KeyStore::new("b", "a", options());
        store.ingest(vec![key(0xAA), key(0xBB)]);
        store.mark_key_in_use(1).await.unwrap();

        let marked = store.mark_key_in_use(1).await.unwrap();
        assert_eq!(marked.key_id, 2);
        assert_eq!(marked.digest, key(0xBB).digest());
    }

    #[tokio::test]
    async fn test_mark_reserved_key_with_nothing_spare() {
        let store = KeyStore::new("b", "a", options());
        store.ingest(vec![key(0xAA)]);
        store.mark_key_in_use(1).await.unwrap();

        let result = store.mark_key_in_use(1).await;
        let expected = "Key already reserved, no new keys available";
        assert!(matches!(result, Err(KeyStoreError::Unavailable(msg)) if msg == expected));
    }

    #[tokio::test]
    async fn test_mark_waits_for_key_to_arrive() {
        let store = Arc::new(KeyStore::new("b", "a", options()));
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.mark_key_in_use(1).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.reserved_count(), 1);
        store.ingest(vec![key(0xAA)]);

        let marked = waiter.await.unwrap().unwrap();
        assert_eq!(marked.key_id, 1);
        assert_eq!(marked.digest, key(0xAA).digest());
        // the filled placeholder is not handed out as a new key
        assert_eq!(store.unused_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_placeholder_is_replaced() {
        let options = KeyStoreOptions::default().with_wait_timeout(Duration::from_millis(30));
        let store = KeyStore::new("b", "a", options);
        let result = store.mark_key_in_use(5).await;
        assert!(matches!(result, Err(KeyStoreError::Unavailable(_))));
        assert_eq!(store.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_get_existing_key_skips_placeholders() {
        let store = Arc::new(KeyStore::new(
            "b",
            "a",
            KeyStoreOptions::default().with_wait_timeout(Duration::from_millis(100)),
        ));
        let marker = {
            let store = store.clone();
            tokio::spawn(async move { store.mark_key_in_use(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.reserved_count(), 1);

        let result = store.get_existing_key(1).await;
        assert!(matches!(result, Err(KeyStoreError::NotFound(_))));
        assert!(marker.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_store_reserved_key() {
        let store = KeyStore::new("c", "a", options());
        store.store_reserved_key(40, key(4)).unwrap();

        let again = store.store_reserved_key(40, key(5));
        assert!(matches!(again, Err(KeyStoreError::AlreadyExists(_))));
        assert_eq!(store.get_existing_key(40).await.unwrap(), key(4));
    }

    #[tokio::test]
    async fn test_store_reserved_key_fills_placeholder() {
        let store = Arc::new(KeyStore::new("c", "a", options()));
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.mark_key_in_use(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.store_reserved_key(3, key(3)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().key_id, 3);
    }

    #[tokio::test]
    async fn test_overflow_to_backing_store() {
        let backing: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
        let store = KeyStore::new("a", "b", options().with_cache_threshold(1))
            .with_backing_store(backing.clone());
        store.ingest(vec![key(1), key(2), key(3)]);

        assert_eq!(store.unused_count(), 1);
        assert_eq!(backing.counts("b").unwrap().available, 2);
        assert_eq!(store.stats_snapshot().unused_keys_available, 3);

        // peer asks for a key that only the backing store has
        let marked = store.mark_key_in_use(3).await.unwrap();
        assert_eq!(marked.digest, key(3).digest());
        assert_eq!(store.get_existing_key(3).await.unwrap(), key(3));
    }

    #[tokio::test]
    async fn test_numbering_resumes_from_backing_store() {
        let backing: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
        {
            let store = KeyStore::new("a", "b", options()).with_backing_store(backing.clone());
            store.ingest(vec![key(1), key(2)]);
            // dropping flushes to the backing store
        }

        let store = KeyStore::new("a", "b", options()).with_backing_store(backing.clone());
        assert_eq!(store.next_key_id(), 3);
        assert_eq!(backing.counts("b").unwrap().available, 2);
    }

    #[tokio::test]
    async fn test_flush_keeps_placeholders() {
        let backing: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
        let options = KeyStoreOptions::default().with_wait_timeout(Duration::from_millis(100));
        let store =
            Arc::new(KeyStore::new("a", "b", options).with_backing_store(backing.clone()));
        store.ingest(vec![key(1)]);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.mark_key_in_use(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.flush_cache();
        assert_eq!(store.unused_count(), 0);
        assert_eq!(store.reserved_count(), 1);
        assert_eq!(backing.counts("b").unwrap().available, 1);
        waiter.abort();
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let store = Arc::new(KeyStore::new("a", "b", KeyStoreOptions::default()));
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.get_existing_key(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on shutdown")
            .unwrap();
        assert!(matches!(result, Err(KeyStoreError::NotFound(_))));
    }
}
