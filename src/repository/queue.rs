//! Durable FIFO hand-off between stages.
//!
//! One table serves every hop, partitioned by queue name. Ordering is the
//! auto-increment sequence, so consumption is strict insertion order.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use diesel_async::RunQueryDsl;

use super::models::{EntityIdRecord, QueueItemRecord};
use super::pool::{DbPool, DieselError};
use super::retry::retry_on_busy;
use super::util::format_timestamp;
use crate::schema::work_queue;
use crate::with_conn;

#[derive(Clone)]
pub struct DieselWorkQueue {
    pool: DbPool,
}

impl DieselWorkQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append an item. Duplicates are allowed.
    pub async fn publish(&self, queue: &str, entity_id: i64) -> Result<(), DieselError> {
        let now = format_timestamp(Utc::now());
        with_conn!(self.pool, conn, {
            diesel::insert_into(work_queue::table)
                .values((
                    work_queue::queue.eq(queue),
                    work_queue::entity_id.eq(entity_id),
                    work_queue::enqueued_at.eq(&now),
                ))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Append an item unless one for the same id is already waiting.
    ///
    /// The existence check and the insert are one statement, so concurrent
    /// callers cannot both add the id. Returns whether an item was added.
    pub async fn requeue(&self, queue: &str, entity_id: i64) -> Result<bool, DieselError> {
        let now = format_timestamp(Utc::now());
        let now = now.as_str();

        let inserted = retry_on_busy("requeue", move || async move {
            with_conn!(self.pool, conn, {
                diesel::sql_query(
                    "INSERT INTO work_queue (queue, entity_id, enqueued_at) \
                     SELECT ?1, ?2, ?3 \
                     WHERE NOT EXISTS ( \
                       SELECT 1 FROM work_queue WHERE queue = ?1 AND entity_id = ?2)",
                )
                .bind::<Text, _>(queue)
                .bind::<BigInt, _>(entity_id)
                .bind::<Text, _>(now)
                .execute(&mut conn)
                .await
            })
        })
        .await?;

        Ok(inserted > 0)
    }

    /// Remove and return the oldest item, or `None` when the queue is empty.
    ///
    /// Selection and removal are a single statement, so concurrent pullers
    /// never receive the same item.
    pub async fn pull(&self, queue: &str) -> Result<Option<i64>, DieselError> {
        let rows: Vec<EntityIdRecord> = retry_on_busy("pull", move || async move {
            with_conn!(self.pool, conn, {
                diesel::sql_query(
                    "DELETE FROM work_queue \
                     WHERE seq = (SELECT seq FROM work_queue WHERE queue = ?1 ORDER BY seq LIMIT 1) \
                     RETURNING entity_id",
                )
                .bind::<Text, _>(queue)
                .load(&mut conn)
                .await
            })
        })
        .await?;

        Ok(rows.into_iter().next().map(|r| r.entity_id))
    }

    pub async fn len(&self, queue: &str) -> Result<u64, DieselError> {
        with_conn!(self.pool, conn, {
            let count: i64 = work_queue::table
                .filter(work_queue::queue.eq(queue))
                .count()
                .get_result(&mut conn)
                .await?;
            Ok(count as u64)
        })
    }

    pub async fn is_empty(&self, queue: &str) -> Result<bool, DieselError> {
        Ok(self.len(queue).await? == 0)
    }

    pub async fn contains(&self, queue: &str, entity_id: i64) -> Result<bool, DieselError> {
        with_conn!(self.pool, conn, {
            let count: i64 = work_queue::table
                .filter(work_queue::queue.eq(queue))
                .filter(work_queue::entity_id.eq(entity_id))
                .count()
                .get_result(&mut conn)
                .await?;
            Ok(count > 0)
        })
    }

    /// Waiting items, oldest first, without removing them.
    pub async fn peek(&self, queue: &str, limit: i64) -> Result<Vec<QueueItemRecord>, DieselError> {
        with_conn!(self.pool, conn, {
            work_queue::table
                .filter(work_queue::queue.eq(queue))
                .order(work_queue::seq.asc())
                .limit(limit)
                .select(QueueItemRecord::as_select())
                .load(&mut conn)
                .await
        })
    }
}
