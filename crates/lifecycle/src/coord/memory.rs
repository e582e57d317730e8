use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{Coordinator, Entry};
use crate::{Error, Result};

/// An in-memory [`Coordinator`], used when running without a store and in tests.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    entries: Mutex<BTreeMap<String, String>>,
    offline: AtomicBool,
}

impl MemoryCoordinator {
    /// Stores a value unconditionally.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.into(), value.into());
        }
    }

    /// A copy of everything stored.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Makes every following operation fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Coordination("store is offline".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| Error::Coordination("store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl Coordinator for MemoryCoordinator {
    async fn put_if_key_missing(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn get(&self, key: &str, prefix: bool) -> Result<Vec<Entry>> {
        let entries = self.entries()?;
        let found = entries
            .iter()
            .filter(|(k, _)| if prefix { k.starts_with(key) } else { *k == key })
            .map(|(k, v)| Entry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        Ok(found)
    }

    async fn delete_key_if_exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    async fn delete_key_with_prefix(&self, prefix: &str) -> Result<()> {
        self.entries()?.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
