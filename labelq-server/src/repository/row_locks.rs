//! Exclusive row reservations for claim selection.
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`. A claim instead
//! reserves the row id it selected here; other claimers skip reserved ids
//! instead of waiting for them. The reservation is released when its guard
//! drops, whether the claim committed or was abandoned.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use labelq_core::ItemId;

#[derive(Debug, Clone, Default)]
pub struct RowLocks {
    held: Arc<Mutex<HashSet<ItemId>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `id` unless another claim already holds it.
    pub fn try_lock(&self, id: ItemId) -> Option<RowLockGuard> {
        // The set stays consistent even if a holder panicked mid-insert.
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.insert(id) {
            Some(RowLockGuard {
                id,
                held: self.held.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, id: ItemId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

/// Held reservation on one row. Released on drop.
#[derive(Debug)]
pub struct RowLockGuard {
    id: ItemId,
    held: Arc<Mutex<HashSet<ItemId>>>,
}

impl RowLockGuard {
    pub fn id(&self) -> ItemId {
        self.id
    }
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
