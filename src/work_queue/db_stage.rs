//! Status-table-backed work queue for one stage.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::models::{EntityStatus, Failure, RetryMode};
use crate::policy::{FailureOutcome, RetryPolicy};
use crate::repository::{DieselWorkQueue, StatusStore, Transition};

use super::{WorkHandle, WorkQueue, WorkQueueError};

/// Claims entities by flipping their status to `in_progress` in the stage's
/// status table. Queue-fed stages also get their inbound queue so requeued
/// and reaped entities are delivered again.
#[derive(Clone)]
pub struct DbStageQueue {
    store: StatusStore,
    policy: RetryPolicy,
    claim_timeout: Duration,
    inbound: Option<DieselWorkQueue>,
}

impl DbStageQueue {
    pub fn new(store: StatusStore, policy: RetryPolicy, claim_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            claim_timeout,
            inbound: None,
        }
    }

    /// Attach the queue this stage consumes from.
    pub fn with_inbound(mut self, queue: DieselWorkQueue) -> Self {
        self.inbound = Some(queue);
        self
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn mode(&self) -> RetryMode {
        self.store.stage().retry_mode()
    }

    async fn redeliver(&self, entity_id: i64) -> Result<(), WorkQueueError> {
        if let (Some(queue), Some(name)) = (&self.inbound, self.store.stage().inbound_queue()) {
            if queue.requeue(name, entity_id).await? {
                debug!(entity_id, queue = name, "Requeued");
            }
        }
        Ok(())
    }

    /// Register a delivered id as pending if this stage has never seen it.
    ///
    /// Returns false when a row already exists, whatever its status.
    pub async fn accept(&self, entity_id: i64) -> Result<bool, WorkQueueError> {
        let inserted = self
            .store
            .insert_absent(&[entity_id], EntityStatus::Pending)
            .await?;
        Ok(inserted > 0)
    }

    /// Return claims older than the claim timeout to `pending`.
    pub async fn reap(&self) -> Result<Vec<i64>, WorkQueueError> {
        let reaped = self.store.reap_stale(self.claim_timeout).await?;
        if !reaped.is_empty() {
            warn!(
                stage = %self.store.stage(),
                count = reaped.len(),
                "Reclaimed stale claims"
            );
        }
        for id in &reaped {
            self.redeliver(*id).await?;
        }
        Ok(reaped)
    }

    /// Administrative reset of a failed entity back to `pending`.
    pub async fn reseed(&self, entity_id: i64) -> Result<(), WorkQueueError> {
        let change = Transition::to(EntityStatus::Pending);
        match self
            .store
            .transition(entity_id, EntityStatus::Failed, &change)
            .await?
        {
            Some(_) => {
                info!(stage = %self.store.stage(), entity_id, "Reseeded failed entity");
                self.redeliver(entity_id).await
            }
            None => Err(self.rejected(entity_id, EntityStatus::Failed, EntityStatus::Pending).await),
        }
    }

    async fn rejected(
        &self,
        entity_id: i64,
        expected: EntityStatus,
        to: EntityStatus,
    ) -> WorkQueueError {
        match self.store.exists(entity_id).await {
            Ok(false) => WorkQueueError::NotFound(entity_id),
            Ok(true) => WorkQueueError::InvalidTransition {
                entity_id,
                expected,
                to,
            },
            Err(e) => WorkQueueError::Database(e),
        }
    }
}

#[async_trait]
impl WorkQueue for DbStageQueue {
    async fn count_available(&self) -> Result<u64, WorkQueueError> {
        let pending = self.store.list_ids(&[EntityStatus::Pending], None).await?;
        let mut total = pending.len();
        if self.mode() == RetryMode::Cooldown {
            for status in [EntityStatus::Awaiting, EntityStatus::Failed] {
                total += self
                    .store
                    .list_for_retry(status, self.policy.max_attempts, self.policy.cooldown)
                    .await?
                    .len();
            }
        }
        Ok(total as u64)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<WorkHandle>, WorkQueueError> {
        let window = match self.mode() {
            RetryMode::Cooldown => Some(self.policy.window()),
            RetryMode::Requeue => None,
        };
        let ids = self.store.claim_batch(limit, window).await?;
        Ok(ids.into_iter().map(WorkHandle::new).collect())
    }

    async fn claim(&self, entity_id: i64) -> Result<WorkHandle, WorkQueueError> {
        if self.store.claim_one(entity_id).await? {
            return Ok(WorkHandle::new(entity_id));
        }
        match self.store.get(entity_id).await? {
            Some(entity) => Err(WorkQueueError::NotClaimable {
                entity_id,
                status: entity.status,
            }),
            None => Err(WorkQueueError::NotFound(entity_id)),
        }
    }

    async fn complete(
        &self,
        handle: WorkHandle,
        result: Map<String, Value>,
    ) -> Result<(), WorkQueueError> {
        let held = Utc::now() - handle.claimed_at();
        let entity_id = handle.consume();
        let change = Transition::to(EntityStatus::Done).with_extra(result);
        match self
            .store
            .transition(entity_id, EntityStatus::InProgress, &change)
            .await?
        {
            Some(_) => {
                debug!(
                    stage = %self.store.stage(),
                    entity_id,
                    held_ms = held.num_milliseconds(),
                    "Completed"
                );
                Ok(())
            }
            None => Err(self
                .rejected(entity_id, EntityStatus::InProgress, EntityStatus::Done)
                .await),
        }
    }

    async fn defer(&self, handle: WorkHandle) -> Result<(), WorkQueueError> {
        let entity_id = handle.consume();
        let change = Transition::to(EntityStatus::Awaiting);
        match self
            .store
            .transition(entity_id, EntityStatus::InProgress, &change)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(self
                .rejected(entity_id, EntityStatus::InProgress, EntityStatus::Awaiting)
                .await),
        }
    }

    async fn fail(
        &self,
        handle: WorkHandle,
        failure: &Failure,
    ) -> Result<FailureOutcome, WorkQueueError> {
        let entity_id = handle.consume();

        if !failure.is_retryable() {
            let change = Transition::to(EntityStatus::Failed).failed(failure.reason, &failure.detail);
            return match self
                .store
                .transition(entity_id, EntityStatus::InProgress, &change)
                .await?
            {
                Some(_) => {
                    warn!(stage = %self.store.stage(), entity_id, %failure, "Permanent failure");
                    Ok(FailureOutcome::Rejected)
                }
                None => Err(self
                    .rejected(entity_id, EntityStatus::InProgress, EntityStatus::Failed)
                    .await),
            };
        }

        let requeue = self.mode() == RetryMode::Requeue;
        let recorded = self
            .store
            .record_transient_failure(entity_id, self.policy.max_attempts, requeue, &failure.detail)
            .await?;
        let Some((attempts, status)) = recorded else {
            return Err(self
                .rejected(entity_id, EntityStatus::InProgress, EntityStatus::Failed)
                .await);
        };

        let outcome = self.policy.outcome_for(attempts, failure, self.mode());
        if status == EntityStatus::Pending {
            self.redeliver(entity_id).await?;
        }
        if outcome.is_terminal() {
            warn!(
                stage = %self.store.stage(),
                entity_id,
                attempts,
                %failure,
                "Retry budget exhausted"
            );
        } else {
            debug!(stage = %self.store.stage(), entity_id, attempts, %failure, "Attempt failed");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureReason, Stage, TRIAGE_QUEUE};
    use crate::repository::{migrations, DbContext};
    use tempfile::tempdir;

    async fn context() -> (tempfile::TempDir, DbContext) {
        let dir = tempdir().unwrap();
        let db_url = format!("sqlite:{}", dir.path().join("test.db").display());
        migrations::run_migrations(&db_url).await.unwrap();
        (dir, DbContext::from_url(&db_url).unwrap())
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::minutes(15))
    }

    #[tokio::test]
    async fn test_requeue_mode_redelivers_until_exhausted() {
        let (_dir, ctx) = context().await;
        let queue = DbStageQueue::new(ctx.status_store(Stage::Triage), policy(), Duration::minutes(90))
            .with_inbound(ctx.work_queue());
        let inbound = ctx.work_queue();

        assert!(queue.accept(11).await.unwrap());
        assert!(!queue.accept(11).await.unwrap());

        let failure = Failure::transient("classifier timeout");
        for expected in [FailureOutcome::Requeue, FailureOutcome::Requeue] {
            let handle = queue.claim(11).await.unwrap();
            assert_eq!(queue.fail(handle, &failure).await.unwrap(), expected);
            assert_eq!(inbound.pull(TRIAGE_QUEUE).await.unwrap(), Some(11));
        }

        let handle = queue.claim(11).await.unwrap();
        assert_eq!(
            queue.fail(handle, &failure).await.unwrap(),
            FailureOutcome::Exhausted
        );
        assert_eq!(inbound.pull(TRIAGE_QUEUE).await.unwrap(), None);

        let entity = queue.store().get(11).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Failed);
        assert_eq!(entity.attempts, 3);
        assert!(matches!(
            queue.claim(11).await,
            Err(WorkQueueError::NotClaimable {
                status: EntityStatus::Failed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cooldown_mode_keeps_failed_and_defers() {
        let (_dir, ctx) = context().await;
        let queue = DbStageQueue::new(
            ctx.status_store(Stage::Download),
            policy(),
            Duration::minutes(90),
        );
        queue
            .store()
            .insert_absent(&[1, 2], EntityStatus::Pending)
            .await
            .unwrap();

        let mut handles = queue.claim_batch(10).await.unwrap();
        assert_eq!(handles.len(), 2);
        let second = handles.pop().unwrap();
        let first = handles.pop().unwrap();
        assert_eq!(first.entity_id(), 1);

        assert_eq!(
            queue.fail(first, &Failure::transient("portal 502")).await.unwrap(),
            FailureOutcome::RetryAfterCooldown
        );
        queue.defer(second).await.unwrap();

        let one = queue.store().get(1).await.unwrap().unwrap();
        assert_eq!(one.status, EntityStatus::Failed);
        assert_eq!(one.failure_reason, Some(FailureReason::Transient));
        let two = queue.store().get(2).await.unwrap().unwrap();
        assert_eq!(two.status, EntityStatus::Awaiting);
        assert_eq!(two.attempts, 0);

        // Both are inside the cooldown.
        assert!(queue.claim_batch(10).await.unwrap().is_empty());
        assert_eq!(queue.count_available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_complete_merges_result_and_rejects_second_resolution() {
        let (_dir, ctx) = context().await;
        let queue = DbStageQueue::new(ctx.status_store(Stage::Tomados), policy(), Duration::minutes(90));
        queue.accept(4).await.unwrap();

        let handle = queue.claim(4).await.unwrap();
        let mut result = Map::new();
        result.insert("rows".into(), Value::from(3));
        queue.complete(handle, result).await.unwrap();

        let entity = queue.store().get(4).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Done);
        assert_eq!(entity.payload["rows"], 3);

        // A stale handle for an entity that was already resolved.
        let stale = WorkHandle::new(4);
        assert!(matches!(
            queue.complete(stale, Map::new()).await,
            Err(WorkQueueError::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.claim(99).await,
            Err(WorkQueueError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_and_reseed() {
        let (_dir, ctx) = context().await;
        let queue = DbStageQueue::new(ctx.status_store(Stage::Triage), policy(), Duration::minutes(90))
            .with_inbound(ctx.work_queue());
        queue.accept(6).await.unwrap();

        let handle = queue.claim(6).await.unwrap();
        let failure = Failure::permanent(FailureReason::FileLimit, "900 files");
        assert_eq!(
            queue.fail(handle, &failure).await.unwrap(),
            FailureOutcome::Rejected
        );
        let entity = queue.store().get(6).await.unwrap().unwrap();
        assert_eq!(entity.attempts, 0);
        assert_eq!(entity.failure_reason, Some(FailureReason::FileLimit));

        queue.reseed(6).await.unwrap();
        assert!(ctx.work_queue().contains(TRIAGE_QUEUE, 6).await.unwrap());
        assert!(matches!(
            queue.reseed(6).await,
            Err(WorkQueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_reaped_claim_goes_back_on_inbound_queue() {
        let (_dir, ctx) = context().await;
        let queue = DbStageQueue::new(ctx.status_store(Stage::Triage), policy(), Duration::zero())
            .with_inbound(ctx.work_queue());
        let inbound = ctx.work_queue();
        queue.accept(5).await.unwrap();

        // A worker that dies mid-claim never resolves its handle.
        drop(queue.claim(5).await.unwrap());

        assert_eq!(queue.reap().await.unwrap(), vec![5]);
        assert!(inbound.contains(TRIAGE_QUEUE, 5).await.unwrap());
        let entity = queue.store().get(5).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Pending);
        assert_eq!(entity.attempts, 0);
        assert!(entity.claimed_at.is_none());

        // Reaping again while the id is still queued adds nothing.
        drop(queue.claim(5).await.unwrap());
        assert_eq!(queue.reap().await.unwrap(), vec![5]);
        assert_eq!(inbound.len(TRIAGE_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reap_without_inbound_queue_only_resets_status() {
        let (_dir, ctx) = context().await;
        let queue = DbStageQueue::new(ctx.status_store(Stage::Download), policy(), Duration::zero());
        queue.accept(3).await.unwrap();
        drop(queue.claim(3).await.unwrap());

        assert_eq!(queue.reap().await.unwrap(), vec![3]);
        assert!(ctx.work_queue().is_empty(TRIAGE_QUEUE).await.unwrap());
        let entity = queue.store().get(3).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Pending);
    }
}
