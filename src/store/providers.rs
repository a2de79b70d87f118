//! Manage provider records per key.

use std::fmt::{self, Debug, Formatter};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use tracing::trace;

use crate::common::{PeerId, PeerInfo};
use crate::net::Host;
use crate::Result;

/// How long a provider record stays valid.
pub const PROVIDE_VALIDITY: Duration = Duration::from_secs(48 * 60 * 60);
/// How long addresses learned from a provider record are kept in the peerstore.
pub const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_MAX_KEYS: usize = 1024;
const DEFAULT_MAX_PROVIDERS_PER_KEY: usize = 256;

/// Storage of provider records.
pub trait ProviderStore: Send + Sync {
    fn add_provider(&self, key: &[u8], provider: PeerInfo) -> Result<()>;

    /// Unexpired providers of `key`, with the addresses currently known for them.
    fn get_providers(&self, key: &[u8]) -> Result<Vec<PeerInfo>>;
}

/// An LRU cache of providers per key, addresses live in the [Host]'s peerstore.
pub struct MemoryProviderStore {
    host: Arc<dyn Host>,
    local: PeerId,
    keys: Mutex<LruCache<Bytes, LruCache<PeerId, Instant>>>,
    max_providers: NonZeroUsize,
}

impl MemoryProviderStore {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self::with_capacity(
            host,
            NonZeroUsize::new(DEFAULT_MAX_KEYS).unwrap_or(NonZeroUsize::MIN),
            NonZeroUsize::new(DEFAULT_MAX_PROVIDERS_PER_KEY).unwrap_or(NonZeroUsize::MIN),
        )
    }

    pub fn with_capacity(
        host: Arc<dyn Host>,
        max_keys: NonZeroUsize,
        max_providers: NonZeroUsize,
    ) -> Self {
        let local = host.id().clone();

        Self {
            host,
            local,
            keys: Mutex::new(LruCache::new(max_keys)),
            max_providers,
        }
    }
}

impl ProviderStore for MemoryProviderStore {
    fn add_provider(&self, key: &[u8], provider: PeerInfo) -> Result<()> {
        trace!(context = "providers", key = %hex::encode(key), peer = ?provider.id, "Add provider");

        // Our own addresses are not peerstore material.
        if provider.id != self.local {
            self.host
                .add_peer_addrs(&provider.id, &provider.addrs, PROVIDER_ADDR_TTL);
        }

        let expires_at = Instant::now() + PROVIDE_VALIDITY;
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(providers) = keys.get_mut(key) {
            providers.put(provider.id, expires_at);
        } else {
            let mut providers = LruCache::new(self.max_providers);
            providers.put(provider.id, expires_at);
            keys.put(Bytes::copy_from_slice(key), providers);
        }

        Ok(())
    }

    fn get_providers(&self, key: &[u8]) -> Result<Vec<PeerInfo>> {
        let now = Instant::now();

        let ids: Vec<PeerId> = {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);

            let Some(providers) = keys.get_mut(key) else {
                return Ok(Vec::new());
            };

            let expired: Vec<PeerId> = providers
                .iter()
                .filter(|(_, expires_at)| **expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                providers.pop(&id);
            }

            let ids = providers.iter().map(|(id, _)| id.clone()).collect();

            if providers.is_empty() {
                keys.pop(key);
            }

            ids
        };

        Ok(ids
            .into_iter()
            .map(|id| {
                let addrs = self.host.peer_addrs(&id);
                PeerInfo::new(id, addrs)
            })
            .collect())
    }
}

impl Debug for MemoryProviderStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProviderStore")
            .field("local", &self.local)
            .field("max_providers", &self.max_providers)
            .finish()
    }
}
