//! Claim protocol shared by every stage.
//!
//! Each stage follows the same pattern: claim entities, process them outside
//! any transaction, then record exactly one outcome per claim. This module
//! provides the trait so stages only depend on the lifecycle, not on how it
//! is stored.

mod db_stage;
mod error;
mod handle;

pub use db_stage::DbStageQueue;
pub use error::WorkQueueError;
pub use handle::WorkHandle;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::Failure;
use crate::policy::FailureOutcome;

/// A queue that manages the claim/complete/defer/fail lifecycle.
///
/// Implementations guarantee that a single entity is handed to at most one
/// claimant at a time. Result payloads are merged in the same step that marks
/// an entity done.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Entities that a claim could return right now.
    async fn count_available(&self) -> Result<u64, WorkQueueError>;

    /// Claim up to `limit` available entities, oldest first.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<WorkHandle>, WorkQueueError>;

    /// Claim one specific pending entity.
    ///
    /// Returns `WorkQueueError::NotClaimable` if it is in any other status,
    /// which is how duplicate deliveries are recognized.
    async fn claim(&self, entity_id: i64) -> Result<WorkHandle, WorkQueueError>;

    /// Mark a claimed entity done, merging `result` into its payload.
    async fn complete(
        &self,
        handle: WorkHandle,
        result: Map<String, Value>,
    ) -> Result<(), WorkQueueError>;

    /// The resource is not ready yet; retry after the cooldown without
    /// consuming an attempt.
    async fn defer(&self, handle: WorkHandle) -> Result<(), WorkQueueError>;

    /// Record a failed attempt and report what happens next.
    async fn fail(
        &self,
        handle: WorkHandle,
        failure: &Failure,
    ) -> Result<FailureOutcome, WorkQueueError>;
}
