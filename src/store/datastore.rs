//! Key/value storage for records.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;

use crate::Result;

/// Persistent key/value storage.
pub trait Datastore: Send + Sync {
    /// Returns `Ok(None)` if nothing is stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Datastore key of the record stored under the DHT key `key`.
pub fn record_key(key: &[u8]) -> String {
    format!("/{}", hex::encode(key))
}

#[derive(Debug, Default)]
/// A [Datastore] kept in memory.
pub struct MemoryDatastore {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        entries.insert(key.to_string(), value);

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        entries.remove(key);

        Ok(())
    }
}
