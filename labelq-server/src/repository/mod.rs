//! Durable item state.
//!
//! This module defines the `ItemRepository` trait, the authoritative store for
//! item status and labels. Implementations exist for memory (tests, single
//! process) and SQLite.
//!
//! Every status change is a single guarded row update, so a write that races
//! with another writer either applies a legal transition or does nothing.

mod memory;
mod row_locks;
mod sqlite;

pub use memory::InMemoryItemRepository;
pub use row_locks::{RowLockGuard, RowLocks};
pub use sqlite::SqliteItemRepository;

use async_trait::async_trait;
use labelq_core::{CallerId, Item, ItemId, Label, Outcome};
use serde::Serialize;

/// Errors surfaced by item storage.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("item storage failed during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {what} in item storage")]
    Corruption { what: String },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

/// Result of inserting a batch of texts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub loaded: usize,
    /// Texts whose hash already existed, in storage or earlier in the batch.
    pub duplicates: usize,
    /// Empty or whitespace-only texts.
    pub rejected: usize,
}

/// A pending row selected for a claim and held exclusively until the claim
/// finishes. Other claimers skip it. Dropping the reservation without calling
/// [`ItemRepository::mark_locked`] abandons the claim with no status change.
#[derive(Debug)]
pub struct RowReservation {
    item: Item,
    _guard: RowLockGuard,
}

impl RowReservation {
    pub(crate) fn new(item: Item, guard: RowLockGuard) -> Self {
        Self {
            item,
            _guard: guard,
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn item_id(&self) -> ItemId {
        self.item.id
    }
}

/// Outcome of recording a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Status moved to terminal and the label row was written.
    Completed(Label),
    /// This caller already has a label for the item, or the item is terminal.
    AlreadyCompleted,
    /// No item with this id.
    NotFound,
    /// The item is not currently claimed by this caller.
    NotClaimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerCount {
    pub caller: CallerId,
    pub rated: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub total: u64,
    /// Items with status `labeled`.
    pub labeled: u64,
    /// Items with status `pending` or `locked`.
    pub remaining: u64,
    /// Number of `rated` labels per caller, ordered by caller id.
    pub per_caller: Vec<CallerCount>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallerStats {
    pub rated: u64,
    pub skipped: u64,
}

/// Repository trait for the durable item state machine.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Insert texts as `pending` items, skipping any whose hash already exists.
    async fn insert_items(&self, texts: Vec<String>) -> Result<ImportSummary, RepositoryError>;

    async fn get(&self, id: ItemId) -> Result<Option<Item>, RepositoryError>;

    /// Select and reserve the most recently created `pending` item that
    /// `caller` has not labeled, skipping rows reserved by concurrent claims
    /// and any id in `exclude`. Does not change status.
    async fn reserve_pending(
        &self,
        caller: CallerId,
        exclude: &[ItemId],
    ) -> Result<Option<RowReservation>, RepositoryError>;

    /// Move a reserved item `pending -> locked` and release the reservation.
    ///
    /// Returns the updated item, or `None` if the row is no longer pending.
    async fn mark_locked(
        &self,
        reservation: RowReservation,
    ) -> Result<Option<Item>, RepositoryError>;

    /// In one transaction: move the item `locked -> labeled|skipped` and
    /// insert the label row for `(item_id, caller)`.
    async fn complete(
        &self,
        item_id: ItemId,
        caller: CallerId,
        outcome: Outcome,
    ) -> Result<CompletionOutcome, RepositoryError>;

    /// Ids of all items currently `locked`.
    async fn locked_ids(&self) -> Result<Vec<ItemId>, RepositoryError>;

    /// Move `locked -> pending`. Returns false if the item was not locked.
    async fn reset_to_pending(&self, id: ItemId) -> Result<bool, RepositoryError>;

    async fn labels_for_item(&self, id: ItemId) -> Result<Vec<Label>, RepositoryError>;

    async fn global_stats(&self) -> Result<GlobalStats, RepositoryError>;

    async fn caller_stats(&self, caller: CallerId) -> Result<CallerStats, RepositoryError>;
}
