//! Per-caller assignment tracking.
//!
//! The pointer lives in the lease store, not in process memory, so a caller
//! can resume from any instance.

use labelq_core::{CallerId, ItemId, ItemStatus, PromptHandle};
use tracing::{debug, info};

use super::{AssignedTask, TaskCoordinator, TaskError};

/// What a caller's pointer refers to right now.
enum Pointer {
    Held(AssignedTask),
    Stale,
    Empty,
}

impl TaskCoordinator {
    /// Return the caller's current item if they still hold it.
    ///
    /// A pointer is honoured only while the item is `locked` and its live
    /// lease belongs to the caller. Anything else is a leftover from an
    /// expired or completed claim and is cleared.
    pub(super) async fn resume(&self, caller: CallerId) -> Result<Option<AssignedTask>, TaskError> {
        match self.inspect_pointer(caller).await? {
            Pointer::Held(task) => {
                info!("Caller {} resumed item {}", caller, task.item.id);
                Ok(Some(task))
            }
            Pointer::Stale => {
                self.leases.clear_assignment(caller).await?;
                Ok(None)
            }
            Pointer::Empty => Ok(None),
        }
    }

    /// Like `resume`, but leaves a stale pointer in place.
    pub(super) async fn peek(&self, caller: CallerId) -> Result<Option<AssignedTask>, TaskError> {
        match self.inspect_pointer(caller).await? {
            Pointer::Held(task) => Ok(Some(task)),
            Pointer::Stale | Pointer::Empty => Ok(None),
        }
    }

    async fn inspect_pointer(&self, caller: CallerId) -> Result<Pointer, TaskError> {
        let Some(assignment) = self.leases.get_assignment(caller).await? else {
            return Ok(Pointer::Empty);
        };
        let item_id = assignment.item_id;

        let item = match self.items.get(item_id).await? {
            Some(item) if item.status == ItemStatus::Locked => item,
            other => {
                debug!(
                    "Pointer of caller {} refers to item {} in state {:?}",
                    caller,
                    item_id,
                    other.map(|item| item.status)
                );
                return Ok(Pointer::Stale);
            }
        };

        let owner = self.leases.owner(item_id).await?;
        if owner != Some(caller) {
            debug!(
                "Pointer of caller {} refers to item {} leased to {:?}",
                caller, item_id, owner
            );
            return Ok(Pointer::Stale);
        }

        Ok(Pointer::Held(AssignedTask {
            item,
            handle: assignment.handle,
            resumed: true,
        }))
    }

    /// Store the transport's handle for the prompt showing `item_id` to
    /// `caller`. Returns false if the caller does not hold the item's lease.
    pub async fn record_presentation(
        &self,
        caller: CallerId,
        item_id: ItemId,
        handle: PromptHandle,
    ) -> Result<bool, TaskError> {
        if self.leases.owner(item_id).await? != Some(caller) {
            return Ok(false);
        }
        self.leases
            .set_assignment(caller, item_id, Some(&handle))
            .await?;
        Ok(true)
    }
}
