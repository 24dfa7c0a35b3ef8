//! In-memory implementation of `ItemRepository`.
//!
//! All state is held in memory and lost on restart. Transitions are checked
//! against the item state machine exactly as the SQLite guards enforce them.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use labelq_core::{text_hash, CallerId, Item, ItemId, ItemStatus, Label, LabelAction, Outcome};
use tokio::sync::RwLock;

use super::{
    CallerCount, CallerStats, CompletionOutcome, GlobalStats, ImportSummary, ItemRepository,
    RepositoryError, RowLocks, RowReservation,
};

#[derive(Default)]
struct Tables {
    items: BTreeMap<ItemId, Item>,
    hashes: HashSet<String>,
    labels: HashMap<(ItemId, CallerId), Label>,
    next_id: i64,
}

/// In-memory item repository.
#[derive(Default)]
pub struct InMemoryItemRepository {
    tables: RwLock<Tables>,
    row_locks: RowLocks,
}

impl InMemoryItemRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemRepository for InMemoryItemRepository {
    async fn insert_items(&self, texts: Vec<String>) -> Result<ImportSummary, RepositoryError> {
        let mut tables = self.tables.write().await;
        let created_at = Utc::now();
        let mut summary = ImportSummary::default();

        for text in texts {
            if text.trim().is_empty() {
                summary.rejected += 1;
                continue;
            }
            let hash = text_hash(&text);
            if !tables.hashes.insert(hash.clone()) {
                summary.duplicates += 1;
                continue;
            }
            tables.next_id += 1;
            let id = ItemId(tables.next_id);
            tables.items.insert(
                id,
                Item {
                    id,
                    text,
                    text_hash: hash,
                    status: ItemStatus::Pending,
                    created_at,
                },
            );
            summary.loaded += 1;
        }

        Ok(summary)
    }

    async fn get(&self, id: ItemId) -> Result<Option<Item>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.items.get(&id).cloned())
    }

    async fn reserve_pending(
        &self,
        caller: CallerId,
        exclude: &[ItemId],
    ) -> Result<Option<RowReservation>, RepositoryError> {
        let tables = self.tables.read().await;

        let mut candidates: Vec<&Item> = tables
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Pending)
            .filter(|item| !tables.labels.contains_key(&(item.id, caller)))
            .filter(|item| !exclude.contains(&item.id))
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(candidates.into_iter().find_map(|item| {
            self.row_locks
                .try_lock(item.id)
                .map(|guard| RowReservation::new(item.clone(), guard))
        }))
    }

    async fn mark_locked(
        &self,
        reservation: RowReservation,
    ) -> Result<Option<Item>, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(item) = tables.items.get_mut(&reservation.item_id()) else {
            return Ok(None);
        };
        if !item.status.can_transition_to(ItemStatus::Locked) {
            return Ok(None);
        }
        item.status = ItemStatus::Locked;
        Ok(Some(item.clone()))
    }

    async fn complete(
        &self,
        item_id: ItemId,
        caller: CallerId,
        outcome: Outcome,
    ) -> Result<CompletionOutcome, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(status) = tables.items.get(&item_id).map(|item| item.status) else {
            return Ok(CompletionOutcome::NotFound);
        };
        if tables.labels.contains_key(&(item_id, caller)) || status.is_terminal() {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }
        let next = outcome.terminal_status();
        if !status.can_transition_to(next) {
            return Ok(CompletionOutcome::NotClaimed);
        }

        let label = Label::new(item_id, caller, outcome, Utc::now());
        if let Some(item) = tables.items.get_mut(&item_id) {
            item.status = next;
        }
        tables.labels.insert((item_id, caller), label.clone());
        Ok(CompletionOutcome::Completed(label))
    }

    async fn locked_ids(&self) -> Result<Vec<ItemId>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Locked)
            .map(|item| item.id)
            .collect())
    }

    async fn reset_to_pending(&self, id: ItemId) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.items.get_mut(&id) {
            Some(item) if item.status == ItemStatus::Locked => {
                item.status = ItemStatus::Pending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn labels_for_item(&self, id: ItemId) -> Result<Vec<Label>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut labels: Vec<Label> = tables
            .labels
            .values()
            .filter(|label| label.item_id == id)
            .cloned()
            .collect();
        labels.sort_by_key(|label| label.user_id);
        Ok(labels)
    }

    async fn global_stats(&self) -> Result<GlobalStats, RepositoryError> {
        let tables = self.tables.read().await;
        let mut stats = GlobalStats {
            total: tables.items.len() as u64,
            ..GlobalStats::default()
        };
        for item in tables.items.values() {
            match item.status {
                ItemStatus::Labeled => stats.labeled += 1,
                ItemStatus::Pending | ItemStatus::Locked => stats.remaining += 1,
                ItemStatus::Skipped => {}
            }
        }

        let mut per_caller: BTreeMap<CallerId, u64> = BTreeMap::new();
        for label in tables.labels.values() {
            if label.action == LabelAction::Rated {
                *per_caller.entry(label.user_id).or_default() += 1;
            }
        }
        stats.per_caller = per_caller
            .into_iter()
            .map(|(caller, rated)| CallerCount { caller, rated })
            .collect();

        Ok(stats)
    }

    async fn caller_stats(&self, caller: CallerId) -> Result<CallerStats, RepositoryError> {
        let tables = self.tables.read().await;
        let mut stats = CallerStats::default();
        for label in tables.labels.values().filter(|l| l.user_id == caller) {
            match label.action {
                LabelAction::Rated => stats.rated += 1,
                LabelAction::Skipped => stats.skipped += 1,
            }
        }
        Ok(stats)
    }
}
