pub mod config;
pub mod coordinator;
mod db;
pub mod http;
pub mod lease;
pub mod reconciliation;
pub mod repository;
pub mod shutdown;

use std::sync::Arc;

pub use coordinator::{
    AssignedTask, CoordinatorSettings, TaskCoordinator, TaskError, TaskRequest,
};
pub use lease::{LeaseStore, LeaseStoreError};
pub use reconciliation::{SweepReport, Sweeper};
pub use repository::{CompletionOutcome, ItemRepository, RepositoryError};

pub struct AppState {
    pub coordinator: Arc<TaskCoordinator>,
}
