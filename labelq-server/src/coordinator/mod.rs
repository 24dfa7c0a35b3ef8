//! Task assignment protocols.
//!
//! `TaskCoordinator` ties the item repository (durable truth about what has
//! happened) to the lease store (ephemeral truth about who holds what). The
//! two stores share no transaction; consistency comes from the order in which
//! the protocols touch them:
//!
//! - claim: reserve a pending row, take the lease, then mark the row locked
//! - completion: commit status and label, then drop the lease and pointer
//! - recovery: only the sweeper moves `locked` back to `pending`

mod assignment;
mod claim;
mod completion;

use std::sync::Arc;
use std::time::Duration;

use labelq_core::{CallerId, Item, PromptHandle};
use serde::Serialize;
use tracing::{debug, warn};

use crate::lease::{LeaseStore, LeaseStoreError};
use crate::repository::{
    CallerStats, GlobalStats, ImportSummary, ItemRepository, RepositoryError,
};

/// Lifetime of the per-caller request guard. Bounds how long a request
/// abandoned mid-flight blocks the caller's next one.
const REQUEST_GUARD_TTL: Duration = Duration::from_secs(10);

/// Unexpected failure of either store. Expected conditions are reported
/// through outcome enums instead.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Lease(#[from] LeaseStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Lifetime of an item lease.
    pub lease_ttl: Duration,
    /// Items tried per request when leases are contended. At least 1.
    pub claim_attempts: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(900),
            claim_attempts: 3,
        }
    }
}

/// An item handed to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignedTask {
    pub item: Item,
    /// Handle of the previous presentation when resuming, so the transport
    /// can replace it.
    pub handle: Option<PromptHandle>,
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRequest {
    Assigned(AssignedTask),
    NoneAvailable,
}

pub struct TaskCoordinator {
    items: Arc<dyn ItemRepository>,
    leases: LeaseStore,
    settings: CoordinatorSettings,
}

impl TaskCoordinator {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        leases: LeaseStore,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            items,
            leases,
            settings,
        }
    }

    pub fn items(&self) -> &Arc<dyn ItemRepository> {
        &self.items
    }

    pub fn leases(&self) -> &LeaseStore {
        &self.leases
    }

    /// Return the caller's current assignment if it is still theirs,
    /// otherwise claim a fresh item.
    ///
    /// Requests from one caller are serialized by a short guard key. A
    /// request that overlaps another only reports the assignment the other
    /// has settled, or `NoneAvailable`, and never claims.
    pub async fn request_task(&self, caller: CallerId) -> Result<TaskRequest, TaskError> {
        let token = uuid::Uuid::new_v4().to_string();
        if !self
            .leases
            .begin_request(caller, &token, REQUEST_GUARD_TTL)
            .await?
        {
            debug!("Caller {} already has a request in flight", caller);
            return Ok(match self.peek(caller).await? {
                Some(task) => TaskRequest::Assigned(task),
                None => TaskRequest::NoneAvailable,
            });
        }

        let result = self.resume_or_claim(caller).await;
        if let Err(e) = self.leases.end_request(caller, &token).await {
            warn!("Failed to release request guard for caller {}: {}", caller, e);
        }
        result
    }

    async fn resume_or_claim(&self, caller: CallerId) -> Result<TaskRequest, TaskError> {
        if let Some(task) = self.resume(caller).await? {
            return Ok(TaskRequest::Assigned(task));
        }

        match self.claim(caller).await? {
            Some(item) => Ok(TaskRequest::Assigned(AssignedTask {
                item,
                handle: None,
                resumed: false,
            })),
            None => {
                debug!("No pending item available for caller {}", caller);
                Ok(TaskRequest::NoneAvailable)
            }
        }
    }

    pub async fn add_items(&self, texts: Vec<String>) -> Result<ImportSummary, TaskError> {
        Ok(self.items.insert_items(texts).await?)
    }

    pub async fn global_stats(&self) -> Result<GlobalStats, TaskError> {
        Ok(self.items.global_stats().await?)
    }

    pub async fn caller_stats(&self, caller: CallerId) -> Result<CallerStats, TaskError> {
        Ok(self.items.caller_stats(caller).await?)
    }
}
