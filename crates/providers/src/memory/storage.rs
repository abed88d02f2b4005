use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::lifecycle::Lifecycle;
use crate::storage::{StorageProvider, parse_counter};
use crate::Result;

const PROVIDER: &str = "in-memory storage";

/// Shared in-memory key space.
///
/// Cloning yields another reference to the same data, so every provider
/// handle created from one store sees the same keys.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys written so far.
    pub async fn key_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if `key` has been written.
    pub async fn contains_key(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Clears all keys.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// In-memory storage provider for testing.
///
/// Each handle has its own lifecycle; the data lives in the [`InMemoryStore`]
/// it was created from. Increments hold the write lock for the whole
/// read-modify-write, which makes them atomic across handles.
#[derive(Debug)]
pub struct InMemoryStorageProvider {
    store: InMemoryStore,
    lifecycle: RwLock<Lifecycle>,
}

impl InMemoryStorageProvider {
    /// Creates a provider handle over `store`.
    pub fn new(store: InMemoryStore) -> Self {
        Self {
            store,
            lifecycle: RwLock::new(Lifecycle::default()),
        }
    }

    /// Returns the store this handle reads and writes.
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.lifecycle.read().await.namespace(PROVIDER).map(|_| ())
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorageProvider {
    async fn initialize(&self, namespace: &str) -> Result<()> {
        self.lifecycle.write().await.open(namespace)?;
        tracing::debug!(%namespace, "in-memory storage initialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.lifecycle.write().await = Lifecycle::Closed;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.ensure_ready().await?;
        let mut entries = self.store.entries.write().await;
        let current = match entries.get(key) {
            Some(raw) => parse_counter(key, raw)?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(key.to_string(), Bytes::from(next.to_string()));
        Ok(next)
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_ready().await?;
        self.store
            .entries
            .write()
            .await
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_ready().await?;
        Ok(self.store.entries.read().await.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderError;
    use crate::storage::StorageProviderExt;

    async fn ready_provider() -> InMemoryStorageProvider {
        let provider = InMemoryStorageProvider::new(InMemoryStore::new());
        provider.initialize("test").await.unwrap();
        provider
    }

    #[tokio::test]
    async fn increment_starts_at_one() {
        let provider = ready_provider().await;
        assert_eq!(provider.increment("seq").await.unwrap(), 1);
        assert_eq!(provider.increment("seq").await.unwrap(), 2);
        assert_eq!(provider.increment("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counter_is_readable_through_get() {
        let provider = ready_provider().await;
        provider.increment("deps").await.unwrap();
        provider.increment("deps").await.unwrap();
        assert_eq!(provider.get_counter("deps").await.unwrap(), 2);
        assert_eq!(provider.get_counter("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_then_get_returns_last_write() {
        let provider = ready_provider().await;
        provider.set("k", Bytes::from_static(b"a")).await.unwrap();
        provider.set("k", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(provider.get("k").await.unwrap(), Some(Bytes::from_static(b"b")));
        assert!(provider.value_equals("k", b"b").await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let provider = ready_provider().await;
        assert_eq!(provider.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_on_non_counter_fails() {
        let provider = ready_provider().await;
        provider.set("status", Bytes::from_static(b"fail")).await.unwrap();
        let err = provider.increment("status").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidCounter { .. }));
    }

    #[tokio::test]
    async fn operations_require_initialize() {
        let provider = InMemoryStorageProvider::new(InMemoryStore::new());
        let err = provider.increment("seq").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let provider = ready_provider().await;
        provider.close().await.unwrap();
        let err = provider.get("k").await.unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyClosed));
    }

    #[tokio::test]
    async fn handles_share_one_store() {
        let store = InMemoryStore::new();
        let a = InMemoryStorageProvider::new(store.clone());
        let b = InMemoryStorageProvider::new(store.clone());
        a.initialize("a").await.unwrap();
        b.initialize("b").await.unwrap();

        a.set("shared", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(b.get("shared").await.unwrap(), Some(Bytes::from_static(b"x")));
        assert_eq!(store.key_count().await, 1);

        a.close().await.unwrap();
        assert!(b.get("shared").await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_increments_lose_no_updates() {
        let store = InMemoryStore::new();
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let provider = InMemoryStorageProvider::new(store.clone());
            tasks.push(tokio::spawn(async move {
                provider.initialize("race").await.unwrap();
                provider.increment("counter").await.unwrap()
            }));
        }

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    }
}
