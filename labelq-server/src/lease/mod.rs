//! Shared lease store.
//!
//! Leases are advisory, self-expiring claims on items, kept outside the item
//! database. The item database says what has happened; the lease store says
//! who currently holds exclusive access. The same store also keeps each
//! caller's assignment pointer so that any server instance can resume any
//! caller's task.
//!
//! Every operation here is atomic for a single key. Nothing spans keys.

mod memory;
mod sqlite;

pub use memory::InMemoryLeaseBackend;
pub use sqlite::SqliteLeaseBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labelq_core::{keys, CallerId, ItemId, PromptHandle};

/// Errors surfaced by the lease store.
#[derive(Debug, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("lease store failed during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt value under lease key {key}")]
    Corruption { key: String },
}

impl LeaseStoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(key: impl Into<String>) -> Self {
        Self::Corruption { key: key.into() }
    }
}

/// Key/value primitives a lease store needs.
///
/// Keys set with a TTL disappear once it elapses: expired keys must be
/// invisible to every read, and reclaimable by `set_if_absent`.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Store `value` under `key` with the given TTL only if no live value
    /// exists. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError>;

    /// Store `value` under `key` with no expiry, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), LeaseStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LeaseStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, LeaseStoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Delete every listed key. Returns how many live keys were removed.
    async fn delete(&self, keys: &[String]) -> Result<usize, LeaseStoreError>;

    /// Delete `key` only if its live value equals `value`.
    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, LeaseStoreError>;

    /// Drop expired entries from storage. Backends that never keep expired
    /// entries around can rely on the default.
    async fn purge_expired(&self) -> Result<usize, LeaseStoreError> {
        Ok(0)
    }
}

/// A caller's stored assignment pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub item_id: ItemId,
    /// Handle of the last presentation, if the transport reported one.
    pub handle: Option<PromptHandle>,
}

/// Typed lease operations over a [`LeaseBackend`].
#[derive(Clone)]
pub struct LeaseStore {
    backend: Arc<dyn LeaseBackend>,
}

impl LeaseStore {
    pub fn new(backend: Arc<dyn LeaseBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLeaseBackend::new()))
    }

    /// Take the lease on `item_id` for `caller`. Returns false if a live lease
    /// already exists, whoever owns it.
    pub async fn acquire(
        &self,
        item_id: ItemId,
        caller: CallerId,
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError> {
        self.backend
            .set_if_absent(&keys::item_lease(item_id), &caller.to_string(), ttl)
            .await
    }

    /// Delete the lease on `item_id` unconditionally. No-op if absent.
    pub async fn release(&self, item_id: ItemId) -> Result<(), LeaseStoreError> {
        self.backend.delete(&[keys::item_lease(item_id)]).await?;
        Ok(())
    }

    /// Delete the lease on `item_id` only if `caller` holds it.
    pub async fn release_if_owner(
        &self,
        item_id: ItemId,
        caller: CallerId,
    ) -> Result<bool, LeaseStoreError> {
        self.backend
            .delete_if_value(&keys::item_lease(item_id), &caller.to_string())
            .await
    }

    pub async fn exists(&self, item_id: ItemId) -> Result<bool, LeaseStoreError> {
        self.backend.exists(&keys::item_lease(item_id)).await
    }

    /// Caller holding the live lease on `item_id`, if any.
    pub async fn owner(&self, item_id: ItemId) -> Result<Option<CallerId>, LeaseStoreError> {
        let key = keys::item_lease(item_id);
        match self.backend.get(&key).await? {
            Some(value) => value
                .parse::<CallerId>()
                .map(Some)
                .map_err(|_| LeaseStoreError::corruption(key)),
            None => Ok(None),
        }
    }

    /// Point `caller` at `item_id`. A `None` handle clears any handle left
    /// over from an earlier assignment.
    pub async fn set_assignment(
        &self,
        caller: CallerId,
        item_id: ItemId,
        handle: Option<&PromptHandle>,
    ) -> Result<(), LeaseStoreError> {
        self.backend
            .set(&keys::current_item(caller), &item_id.to_string())
            .await?;
        let prompt_key = keys::current_prompt(caller);
        match handle {
            Some(handle) => self.backend.set(&prompt_key, &handle.0).await,
            None => {
                self.backend.delete(&[prompt_key]).await?;
                Ok(())
            }
        }
    }

    pub async fn get_assignment(
        &self,
        caller: CallerId,
    ) -> Result<Option<Assignment>, LeaseStoreError> {
        let item_key = keys::current_item(caller);
        let Some(raw) = self.backend.get(&item_key).await? else {
            return Ok(None);
        };
        let item_id = raw
            .trim()
            .parse::<i64>()
            .map(ItemId)
            .map_err(|_| LeaseStoreError::corruption(item_key))?;
        let handle = self
            .backend
            .get(&keys::current_prompt(caller))
            .await?
            .map(PromptHandle);
        Ok(Some(Assignment { item_id, handle }))
    }

    pub async fn clear_assignment(&self, caller: CallerId) -> Result<(), LeaseStoreError> {
        self.backend
            .delete(&[keys::current_item(caller), keys::current_prompt(caller)])
            .await?;
        Ok(())
    }

    /// Take `caller`'s request guard under `token`. Returns false while
    /// another request from the same caller holds it.
    pub async fn begin_request(
        &self,
        caller: CallerId,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError> {
        self.backend
            .set_if_absent(&keys::request_guard(caller), token, ttl)
            .await
    }

    /// Drop `caller`'s request guard if `token` still holds it.
    pub async fn end_request(
        &self,
        caller: CallerId,
        token: &str,
    ) -> Result<bool, LeaseStoreError> {
        self.backend
            .delete_if_value(&keys::request_guard(caller), token)
            .await
    }

    /// Take the sweeper lease for `instance`. Returns false if another
    /// instance holds it.
    pub async fn try_acquire_sweep(
        &self,
        instance: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError> {
        self.backend
            .set_if_absent(keys::SWEEPER_LEASE_KEY, instance, ttl)
            .await
    }

    /// Release the sweeper lease if `instance` still holds it.
    pub async fn release_sweep(&self, instance: &str) -> Result<bool, LeaseStoreError> {
        self.backend
            .delete_if_value(keys::SWEEPER_LEASE_KEY, instance)
            .await
    }

    pub async fn purge_expired(&self) -> Result<usize, LeaseStoreError> {
        self.backend.purge_expired().await
    }
}
