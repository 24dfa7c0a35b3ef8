//! Claim protocol.
//!
//! The status write is deferred until after the lease is taken. Losing the
//! lease race therefore leaves nothing to undo: the reservation is dropped and
//! the row is still `pending`.

use labelq_core::{CallerId, Item, ItemId};
use tracing::{error, info, warn};

use super::{TaskCoordinator, TaskError};

impl TaskCoordinator {
    /// Claim the most recently created pending item for `caller`.
    ///
    /// Items whose lease is already held are skipped, up to
    /// `claim_attempts` of them per call. Returns `None` once nothing
    /// claimable remains or the attempts run out.
    pub async fn claim(&self, caller: CallerId) -> Result<Option<Item>, TaskError> {
        let attempts = self.settings.claim_attempts.max(1);
        let mut contended: Vec<ItemId> = Vec::new();

        for attempt in 1..=attempts {
            let Some(reservation) = self.items.reserve_pending(caller, &contended).await? else {
                return Ok(None);
            };
            let item_id = reservation.item_id();

            if !self
                .leases
                .acquire(item_id, caller, self.settings.lease_ttl)
                .await?
            {
                warn!(
                    "Lease for item {} already held, caller {} skipping it (attempt {}/{})",
                    item_id, caller, attempt, attempts
                );
                drop(reservation);
                contended.push(item_id);
                continue;
            }

            let item = match self.items.mark_locked(reservation).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    // The row left `pending` between selection and update.
                    warn!(
                        "Item {} stopped being pending during claim by caller {}",
                        item_id, caller
                    );
                    self.release_quietly(item_id, caller).await;
                    contended.push(item_id);
                    continue;
                }
                Err(e) => {
                    error!(
                        "Failed to lock item {} for caller {}: {}",
                        item_id, caller, e
                    );
                    self.release_quietly(item_id, caller).await;
                    return Err(e.into());
                }
            };

            // The item is now locked and leased. If the pointer write fails the
            // lease expires and the sweeper returns the item to the queue.
            self.leases.set_assignment(caller, item_id, None).await?;

            info!("Caller {} claimed item {}", caller, item_id);
            return Ok(Some(item));
        }

        warn!(
            "Caller {} found only contended items after {} attempts",
            caller, attempts
        );
        Ok(None)
    }

    /// Drop `caller`'s lease on `item_id`, logging instead of failing.
    pub(super) async fn release_quietly(&self, item_id: ItemId, caller: CallerId) {
        if let Err(e) = self.leases.release_if_owner(item_id, caller).await {
            warn!("Failed to release lease for item {}: {}", item_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use labelq_core::{keys, ItemStatus};

    use super::super::test_support::*;
    use super::super::{CoordinatorSettings, TaskCoordinator};
    use super::*;
    use crate::lease::LeaseStore;
    use crate::repository::InMemoryItemRepository;

    const TTL: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn test_claim_locks_leases_and_points() {
        let coordinator = coordinator_with(&["foo"]).await;
        let item = coordinator.claim(CallerId(7)).await.unwrap().unwrap();

        assert_eq!(item.status, ItemStatus::Locked);
        assert_eq!(
            coordinator.items().get(item.id).await.unwrap().unwrap().status,
            ItemStatus::Locked
        );
        assert_eq!(
            coordinator.leases().owner(item.id).await.unwrap(),
            Some(CallerId(7))
        );
        let pointer = coordinator
            .leases()
            .get_assignment(CallerId(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.item_id, item.id);
        assert_eq!(pointer.handle, None);
    }

    #[tokio::test]
    async fn test_lost_lease_race_leaves_item_pending() {
        let coordinator = TaskCoordinator::new(
            Arc::new(InMemoryItemRepository::new()),
            LeaseStore::in_memory(),
            CoordinatorSettings {
                lease_ttl: TTL,
                claim_attempts: 1,
            },
        );
        coordinator.add_items(vec!["foo".into()]).await.unwrap();
        // A lease left behind by an earlier holder.
        assert!(coordinator
            .leases()
            .acquire(ItemId(1), CallerId(99), TTL)
            .await
            .unwrap());

        assert_eq!(coordinator.claim(CallerId(7)).await.unwrap(), None);
        assert_eq!(
            coordinator.items().get(ItemId(1)).await.unwrap().unwrap().status,
            ItemStatus::Pending
        );
        assert_eq!(
            coordinator.leases().owner(ItemId(1)).await.unwrap(),
            Some(CallerId(99))
        );
        assert_eq!(
            coordinator.leases().get_assignment(CallerId(7)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_contended_item_is_skipped_for_the_next_one() {
        let coordinator = coordinator_with(&["older", "newer"]).await;
        coordinator
            .leases()
            .acquire(ItemId(2), CallerId(99), TTL)
            .await
            .unwrap();

        let item = coordinator.claim(CallerId(7)).await.unwrap().unwrap();
        assert_eq!(item.id, ItemId(1));
        assert_eq!(
            coordinator.items().get(ItemId(2)).await.unwrap().unwrap().status,
            ItemStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let coordinator = coordinator_with(&["a", "b", "c", "d"]).await;
        for id in 1..=4 {
            coordinator
                .leases()
                .acquire(ItemId(id), CallerId(99), TTL)
                .await
                .unwrap();
        }
        assert_eq!(coordinator.claim(CallerId(7)).await.unwrap(), None);
        for id in 1..=4 {
            assert_eq!(
                coordinator.items().get(ItemId(id)).await.unwrap().unwrap().status,
                ItemStatus::Pending
            );
        }
    }

    #[tokio::test]
    async fn test_claim_replaces_stale_handle() {
        let coordinator = coordinator_with(&["foo"]).await;
        coordinator
            .leases()
            .set_assignment(CallerId(7), ItemId(50), Some(&"old-msg".into()))
            .await
            .unwrap();
        let item = coordinator.claim(CallerId(7)).await.unwrap().unwrap();

        let pointer = coordinator
            .leases()
            .get_assignment(CallerId(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.item_id, item.id);
        assert_eq!(pointer.handle, None);
        assert!(coordinator
            .leases()
            .exists(item.id)
            .await
            .unwrap());
        assert_eq!(keys::item_lease(item.id), "lock:item:1");
    }
}
