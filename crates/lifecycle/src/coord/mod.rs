//! The coordination store every job keeps its shared state in.
//!
//! Learners, the job monitor and the lifecycle manager agree on job progress through a
//! hierarchical key space rooted at the training ID. The lifecycle manager only creates the
//! initial keys, records halt requests and event endpoints, and purges the subtree on kill.

use crate::Result;

mod etcd;
pub mod job;
mod memory;

pub use etcd::EtcdCoordinator;
pub use memory::MemoryCoordinator;

/// One key and its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The key, relative to the store's prefix
    pub key: String,
    /// The value stored under it
    pub value: String,
}

/// The operations used on the coordination store. Keys are relative to whatever prefix the
/// store was configured with.
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    /// Stores `value` under `key` unless the key already exists. Returns whether the key was
    /// created.
    async fn put_if_key_missing(&self, key: &str, value: &str) -> Result<bool>;

    /// Gets the entry at `key`, or every entry whose key starts with `key` when `prefix` is set.
    async fn get(&self, key: &str, prefix: bool) -> Result<Vec<Entry>>;

    /// Deletes `key`. Returns whether it existed.
    async fn delete_key_if_exists(&self, key: &str) -> Result<bool>;

    /// Deletes every key starting with `prefix`.
    async fn delete_key_with_prefix(&self, prefix: &str) -> Result<()>;
}
