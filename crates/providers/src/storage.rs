use async_trait::async_trait;
use bytes::Bytes;

use crate::{ProviderError, Result};

/// Core trait for counter/key-value store implementations.
///
/// The saga coordinator relies on two properties only:
/// - `increment` is a true atomic read-modify-write across every process
///   sharing the store (no lost updates)
/// - `set`/`get` on one key are last-writer-wins, and a completed `set` is
///   visible to any later `get` of the same key
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Establishes the connection and records the namespace this handle
    /// writes under.
    async fn initialize(&self, namespace: &str) -> Result<()>;

    /// Releases the connection. Every later operation fails.
    async fn close(&self) -> Result<()>;

    /// Atomically increments the counter stored at `key`.
    ///
    /// Returns the post-increment value; a fresh key yields 1.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Reads the value stored under `key`.
    ///
    /// Returns None if the key has never been written.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
}

/// Extension trait providing convenience methods for storage providers.
#[async_trait]
pub trait StorageProviderExt: StorageProvider {
    /// Reads a counter written by `increment`.
    ///
    /// An absent key reads as 0.
    async fn get_counter(&self, key: &str) -> Result<i64> {
        match self.get(key).await? {
            None => Ok(0),
            Some(raw) => parse_counter(key, &raw),
        }
    }

    /// Checks whether `key` currently holds exactly `expected`.
    async fn value_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        Ok(self
            .get(key)
            .await?
            .is_some_and(|value| value.as_ref() == expected))
    }
}

// Blanket implementation for all StorageProvider implementations
impl<T: StorageProvider + ?Sized> StorageProviderExt for T {}

/// Parses the decimal text form counters are stored in.
pub(crate) fn parse_counter(key: &str, raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| ProviderError::InvalidCounter {
            key: key.to_string(),
            value: String::from_utf8_lossy(raw).into_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_counter_accepts_decimal_text() {
        assert_eq!(parse_counter("k", b"17").unwrap(), 17);
    }

    #[test]
    fn parse_counter_rejects_non_integers() {
        let err = parse_counter("k", b"fail").unwrap_err();
        assert!(matches!(err, ProviderError::InvalidCounter { ref key, ref value } if key == "k" && value == "fail"));
    }
}
