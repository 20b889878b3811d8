//! Pipeline stages.
//!
//! Each stage runs one cycle at a time under the scheduler. A cycle catches
//! per-entity errors itself and records them as transitions; only failures
//! of the stage's own infrastructure surface as a [`StageError`].

pub mod download;
pub mod tomados;
pub mod triage;

pub use download::{DownloadSettings, DownloadStage};
pub use tomados::{TomadosSettings, TomadosStage};
pub use triage::{TriageSettings, TriageStage};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Stage;
use crate::repository::DieselError;
use crate::work_queue::WorkQueueError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Database error: {0}")]
    Database(#[from] DieselError),
    #[error("Work queue error: {0}")]
    WorkQueue(#[from] WorkQueueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Collaborator(String),
}

impl StageError {
    /// The entity was reaped or reseeded while this process worked on it.
    ///
    /// The entity is owned by someone else now, so the cycle carries on.
    pub fn is_lost_claim(&self) -> bool {
        matches!(
            self,
            StageError::WorkQueue(
                WorkQueueError::InvalidTransition { .. } | WorkQueueError::NotFound(_)
            )
        )
    }
}

/// Counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entities this cycle acted on, whatever the outcome.
    pub processed: u64,
    pub done: u64,
    pub failed: u64,
    pub deferred: u64,
    /// Duplicate deliveries dropped without work.
    pub skipped: u64,
}

impl CycleReport {
    pub fn had_work(&self) -> bool {
        self.processed > 0 || self.skipped > 0
    }
}

/// A stage the scheduler can drive.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    /// Runs once before the first cycle.
    async fn prepare(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn run_cycle(&self) -> Result<CycleReport, StageError>;

    /// Work waiting for this stage, for the health report.
    async fn backlog(&self) -> Result<u64, StageError>;
}
