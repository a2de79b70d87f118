//! Kademlia routing table consulted by the DHT node.
//!
//! The node only talks to the table through [RoutingTable], so any k-bucket
//! implementation can be plugged in. [KBucketTable] is the simple in-memory one
//! used by default.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::debug;

use crate::common::{Key, PeerId};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Called with the id of every peer the table drops.
pub type PeerRemovedHook = Box<dyn Fn(&PeerId) + Send + Sync>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingTableError {
    /// The bucket is full and holds no replaceable peer.
    #[error("no capacity in bucket")]
    NoCapacity,
}

/// The routing table operations the node depends on.
///
/// All mutations are issued from the admission loop, reads may come from anywhere.
pub trait RoutingTable: Send + Sync {
    /// Up to `count` peers sorted by XOR distance to `target`.
    fn nearest_peers(&self, target: &Key, count: usize) -> Vec<PeerId>;

    /// Try to admit a peer, returns `Ok(true)` if it was newly added.
    ///
    /// `query_peer` means the peer was observed answering or sending a query.
    /// Peers added with `is_replaceable` may be evicted to make room for others.
    fn try_add_peer(
        &self,
        peer: &PeerId,
        query_peer: bool,
        is_replaceable: bool,
    ) -> Result<bool, RoutingTableError>;

    fn remove_peer(&self, peer: &PeerId);

    /// Returns `false` if the peer is not in the table.
    fn update_last_successful_outbound_query_at(&self, peer: &PeerId, at: SystemTime) -> bool;

    /// Mark every current peer as not evictable by newcomers.
    fn mark_all_peers_irreplaceable(&self);

    fn size(&self) -> usize;

    fn list_peers(&self) -> Vec<PeerId>;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn set_peer_removed_hook(&self, _hook: PeerRemovedHook) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Snapshot of a peer entry in a [KBucketTable].
pub struct PeerEntry {
    id: PeerId,
    key: Key,
    added_at: SystemTime,
    last_useful_at: Option<SystemTime>,
    last_successful_outbound_query_at: SystemTime,
    replaceable: bool,
}

impl PeerEntry {
    // === Getters ===

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn added_at(&self) -> SystemTime {
        self.added_at
    }

    /// Last time the peer was useful to a query, `None` if never.
    pub fn last_useful_at(&self) -> Option<SystemTime> {
        self.last_useful_at
    }

    pub fn last_successful_outbound_query_at(&self) -> SystemTime {
        self.last_successful_outbound_query_at
    }

    pub fn is_replaceable(&self) -> bool {
        self.replaceable
    }
}

/// Simplified in-memory Kademlia routing table, with buckets keyed by
/// common prefix length.
pub struct KBucketTable {
    local: Key,
    bucket_size: usize,
    buckets: RwLock<BTreeMap<usize, KBucket>>,
    removed_hook: RwLock<Option<PeerRemovedHook>>,
}

impl KBucketTable {
    /// Create a new [KBucketTable] centered on `local`.
    pub fn new(local: &PeerId, bucket_size: usize) -> Self {
        KBucketTable {
            local: local.to_key(),
            bucket_size: bucket_size.max(1),
            buckets: RwLock::new(BTreeMap::new()),
            removed_hook: RwLock::new(None),
        }
    }

    // === Getters ===

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Returns a snapshot of a peer's entry, if present.
    pub fn peer(&self, peer: &PeerId) -> Option<PeerEntry> {
        let key = peer.to_key();
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());

        buckets
            .get(&self.local.common_prefix_len(&key))
            .and_then(|bucket| bucket.get(peer))
            .cloned()
    }

    // === Private Methods ===

    fn notify_removed(&self, peer: &PeerId) {
        let hook = self.removed_hook.read().unwrap_or_else(|e| e.into_inner());

        if let Some(hook) = hook.as_ref() {
            hook(peer)
        }
    }
}

impl RoutingTable for KBucketTable {
    fn nearest_peers(&self, target: &Key, count: usize) -> Vec<PeerId> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());

        let mut entries: Vec<_> = buckets
            .values()
            .flat_map(|bucket| bucket.entries.iter())
            .map(|entry| (target.distance(&entry.key), &entry.id))
            .collect();

        entries.sort_by(|a, b| a.0.cmp(&b.0));

        entries
            .into_iter()
            .take(count)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn try_add_peer(
        &self,
        peer: &PeerId,
        query_peer: bool,
        is_replaceable: bool,
    ) -> Result<bool, RoutingTableError> {
        let key = peer.to_key();
        let cpl = self.local.common_prefix_len(&key);

        if key == self.local {
            // Do not add self to the routing table
            return Ok(false);
        }

        let now = SystemTime::now();
        let last_useful_at = query_peer.then_some(now);

        let evicted = {
            let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
            let bucket = buckets.entry(cpl).or_default();

            if let Some(existing) = bucket.get_mut(peer) {
                // Seen before, but never useful until now.
                if existing.last_useful_at.is_none() && query_peer {
                    existing.last_useful_at = last_useful_at;
                }
                return Ok(false);
            }

            let entry = PeerEntry {
                id: peer.clone(),
                key,
                added_at: now,
                last_useful_at,
                last_successful_outbound_query_at: now,
                replaceable: is_replaceable,
            };

            if bucket.entries.len() < self.bucket_size {
                bucket.entries.push(entry);
                None
            } else if let Some(index) = bucket.entries.iter().position(|e| e.replaceable) {
                let evicted = bucket.entries.remove(index);
                bucket.entries.push(entry);
                Some(evicted.id)
            } else {
                return Err(RoutingTableError::NoCapacity);
            }
        };

        if let Some(evicted) = evicted {
            debug!(?evicted, added = ?peer, "Replaced peer in routing table");
            self.notify_removed(&evicted);
        }

        Ok(true)
    }

    fn remove_peer(&self, peer: &PeerId) {
        let cpl = self.local.common_prefix_len(&peer.to_key());

        let removed = {
            let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());

            match buckets.get_mut(&cpl) {
                Some(bucket) => bucket.remove(peer),
                None => false,
            }
        };

        if removed {
            self.notify_removed(peer);
        }
    }

    fn update_last_successful_outbound_query_at(&self, peer: &PeerId, at: SystemTime) -> bool {
        let cpl = self.local.common_prefix_len(&peer.to_key());
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());

        match buckets.get_mut(&cpl).and_then(|bucket| bucket.get_mut(peer)) {
            Some(entry) => {
                entry.last_successful_outbound_query_at = at;
                true
            }
            None => false,
        }
    }

    fn mark_all_peers_irreplaceable(&self) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());

        for entry in buckets.values_mut().flat_map(|b| b.entries.iter_mut()) {
            entry.replaceable = false;
        }
    }

    fn size(&self) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());

        buckets.values().map(|bucket| bucket.entries.len()).sum()
    }

    fn list_peers(&self) -> Vec<PeerId> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());

        buckets
            .values()
            .flat_map(|bucket| bucket.entries.iter().map(|e| e.id.clone()))
            .collect()
    }

    fn set_peer_removed_hook(&self, hook: PeerRemovedHook) {
        *self.removed_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }
}

impl std::fmt::Debug for KBucketTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KBucketTable")
            .field("local", &self.local)
            .field("bucket_size", &self.bucket_size)
            .field("size", &self.size())
            .finish()
    }
}

/// Peers sharing the same common prefix length with the local key,
/// in insertion order.
#[derive(Debug, Clone, Default)]
struct KBucket {
    entries: Vec<PeerEntry>,
}

impl KBucket {
    fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.entries.iter().find(|entry| &entry.id == peer)
    }

    fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerEntry> {
        self.entries.iter_mut().find(|entry| &entry.id == peer)
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| &entry.id != peer);

        self.entries.len() != before
    }
}
