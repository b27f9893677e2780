//! `dw_jobs` - Recurring container snapshots for dockwatch
//!
//! This crate provides:
//! - Next-run computation for interval, daily and weekly schedules
//! - The snapshot runner (locate, commit, prune beyond retention)
//! - The job catalog seeded from configuration
//! - The scheduler loop running due jobs

pub mod catalog;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod snapshot;

use thiserror::Error;

pub use catalog::JobCatalog;
pub use runner::{SnapshotRunner, TargetOutcome};
pub use schedule::next_run_at;
pub use scheduler::{JobScheduler, SchedulerSummary};
pub use snapshot::{SnapshotImage, select_prunable, validate_container_name};

/// Job errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid container name: {0:?}")]
    InvalidContainerName(String),

    #[error("Container {container} not found on {host}")]
    ContainerNotFound { host: String, container: String },

    #[error("Container name {container} matches {matches} containers on {host}")]
    AmbiguousContainer {
        host: String,
        container: String,
        matches: usize,
    },

    #[error("Remote error: {0}")]
    Remote(#[from] dw_remote::RemoteError),

    #[error("Store error: {0}")]
    StoreError(#[from] dw_store::StoreError),
}
