//! Completion protocol.
//!
//! The durable write (terminal status plus label row) commits while the
//! caller holds the item's lease. Lease and pointer cleanup follow and may
//! fail without undoing it: a terminal item with a stale lease is harmless
//! because the sweeper only looks at `locked` items, and the lease expires
//! on its own.

use labelq_core::{CallerId, ItemId, Outcome};
use tracing::{debug, info, warn};

use super::{TaskCoordinator, TaskError};
use crate::repository::CompletionOutcome;

impl TaskCoordinator {
    /// Record `caller`'s outcome for `item_id` and free the item's lease and
    /// the caller's assignment pointer.
    ///
    /// The caller must hold the item's lease for the durable write. A lease
    /// that has expired is taken again first, so a claim by someone else
    /// cannot start while the write is in flight. A live lease held by
    /// someone else means the caller's own claim was lost, and the call
    /// returns `NotClaimed` without touching either store.
    pub async fn complete_task(
        &self,
        item_id: ItemId,
        caller: CallerId,
        outcome: Outcome,
    ) -> Result<CompletionOutcome, TaskError> {
        let retaken = match self.leases.owner(item_id).await? {
            Some(owner) if owner == caller => false,
            Some(owner) => {
                warn!(
                    "Caller {} tried to complete item {} leased to caller {}",
                    caller, item_id, owner
                );
                return Ok(CompletionOutcome::NotClaimed);
            }
            None => {
                if !self
                    .leases
                    .acquire(item_id, caller, self.settings.lease_ttl)
                    .await?
                {
                    warn!(
                        "Caller {} lost the lease on item {} before completing it",
                        caller, item_id
                    );
                    return Ok(CompletionOutcome::NotClaimed);
                }
                debug!("Caller {} retook expired lease on item {}", caller, item_id);
                true
            }
        };

        let result = match self.items.complete(item_id, caller, outcome).await {
            Ok(result) => result,
            Err(e) => {
                if retaken {
                    self.release_quietly(item_id, caller).await;
                }
                return Err(e.into());
            }
        };
        match &result {
            CompletionOutcome::Completed(label) => {
                info!(
                    "Caller {} completed item {} as {}",
                    caller, item_id, label.action
                );
                if let Err(e) = self.leases.release_if_owner(item_id, caller).await {
                    warn!(
                        "Completed item {} but failed to release its lease: {}",
                        item_id, e
                    );
                }
                if let Err(e) = self.leases.clear_assignment(caller).await {
                    warn!(
                        "Completed item {} but failed to clear pointer for caller {}: {}",
                        item_id, caller, e
                    );
                }
                return Ok(result);
            }
            CompletionOutcome::AlreadyCompleted => {
                warn!(
                    "Duplicate completion of item {} by caller {}",
                    item_id, caller
                );
            }
            CompletionOutcome::NotFound => {
                warn!("Caller {} completed unknown item {}", caller, item_id);
            }
            CompletionOutcome::NotClaimed => {
                warn!(
                    "Caller {} completed item {} without holding it",
                    caller, item_id
                );
            }
        }
        if retaken {
            self.release_quietly(item_id, caller).await;
        }
        Ok(result)
    }
}
