//! In-memory lease backend for tests and single-process deployments.
//!
//! Expiry is measured with `tokio::time::Instant` so tests can drive it with
//! a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LeaseBackend, LeaseStoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLeaseBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                // A TTL past the clock's range never expires.
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LeaseStoreError> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LeaseStoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, LeaseStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed)
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, LeaseStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<usize, LeaseStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_is_invisible_and_reclaimable() {
        let backend = InMemoryLeaseBackend::new();
        assert!(backend
            .set_if_absent("k", "a", Duration::from_secs(10))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("a"));
        assert!(!backend
            .set_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
        assert!(backend
            .set_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttl_does_not_overflow() {
        let backend = InMemoryLeaseBackend::new();
        assert!(backend.set_if_absent("k", "a", Duration::MAX).await.unwrap());
        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("a"));
        assert!(!backend
            .set_if_absent("k", "b", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_set_never_expires() {
        let backend = InMemoryLeaseBackend::new();
        backend.set("pointer", "5").await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(backend.get("pointer").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_counts_only_live_keys() {
        let backend = InMemoryLeaseBackend::new();
        backend
            .set_if_absent("short", "x", Duration::from_secs(1))
            .await
            .unwrap();
        backend.set("long", "y").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let removed = backend
            .delete(&["short".to_string(), "long".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_if_value_ignores_expired_match() {
        let backend = InMemoryLeaseBackend::new();
        backend
            .set_if_absent("k", "a", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!backend.delete_if_value("k", "b").await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!backend.delete_if_value("k", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let backend = InMemoryLeaseBackend::new();
        backend
            .set_if_absent("a", "1", Duration::from_secs(1))
            .await
            .unwrap();
        backend
            .set_if_absent("b", "1", Duration::from_secs(100))
            .await
            .unwrap();
        backend.set("c", "1").await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.purge_expired().await.unwrap(), 0);
        assert!(backend.exists("b").await.unwrap());
    }
}
