//! Per-stage status table.
//!
//! Every mutation is a single SQL statement so concurrent stage processes
//! never observe a half-applied transition. Table names come from
//! [`Stage::table`], never from input.

use chrono::{DateTime, Duration, Utc};
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde_json::{Map, Value};

use super::models::{
    AttemptsRecord, ClaimedRecord, EntityIdRecord, EntityRecord, FailureRecord, OptionalIdRecord,
    StatusCountRecord,
};
use super::pool::{DbPool, DieselError};
use super::retry::retry_on_busy;
use super::util::format_timestamp;
use super::{parse_datetime, parse_datetime_opt};
use crate::models::{Entity, EntityStatus, FailureReason, Stage};
use crate::with_conn;

const ENTITY_COLUMNS: &str = "entity_id, status, attempts, failure_reason, last_error, \
                              last_attempt_at, claimed_at, created_at, updated_at, payload";

/// A guarded status change applied to one entity.
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: EntityStatus,
    pub increment_attempt: bool,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    /// Fields merged into the payload in the same statement.
    pub extra: Map<String, Value>,
}

impl Transition {
    pub fn to(status: EntityStatus) -> Self {
        Self {
            to: status,
            increment_attempt: false,
            reason: None,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn failed(mut self, reason: FailureReason, error: impl Into<String>) -> Self {
        self.increment_attempt = reason.is_retryable();
        self.reason = Some(reason);
        self.error = Some(error.into());
        self
    }
}

/// Retry selection parameters used when claiming.
#[derive(Debug, Clone, Copy)]
pub struct RetryWindow {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

/// Convert a database record to a domain model.
impl TryFrom<EntityRecord> for Entity {
    type Error = DieselError;

    fn try_from(record: EntityRecord) -> Result<Self, Self::Error> {
        let status = EntityStatus::from_str(&record.status).ok_or_else(|| {
            DieselError::DeserializationError(
                format!("Invalid entity status: '{}'", record.status).into(),
            )
        })?;
        let failure_reason = match record.failure_reason {
            Some(code) => Some(FailureReason::from_str(&code).ok_or_else(|| {
                DieselError::DeserializationError(
                    format!("Invalid failure reason: '{}'", code).into(),
                )
            })?),
            None => None,
        };
        let payload = match serde_json::from_str::<Value>(&record.payload)
            .map_err(|e| DieselError::DeserializationError(Box::new(e)))?
        {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Ok(Entity {
            entity_id: record.entity_id,
            status,
            attempts: record.attempts.max(0) as u32,
            failure_reason,
            last_error: record.last_error,
            last_attempt_at: parse_datetime_opt(record.last_attempt_at),
            claimed_at: parse_datetime_opt(record.claimed_at),
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            payload,
        })
    }
}

fn status_list(statuses: &[EntityStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn payload_json(extra: &Map<String, Value>) -> String {
    serde_json::to_string(extra).unwrap_or_else(|_| "{}".to_string())
}

/// Durable per-entity state for one stage.
#[derive(Clone)]
pub struct StatusStore {
    pool: DbPool,
    stage: Stage,
}

impl StatusStore {
    pub fn new(pool: DbPool, stage: Stage) -> Self {
        Self { pool, stage }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn table(&self) -> &'static str {
        self.stage.table()
    }

    /// Create or update an entity without touching its attempt counter.
    ///
    /// A missing `last_attempt_at` keeps whatever the row already has.
    pub async fn upsert(
        &self,
        entity_id: i64,
        status: EntityStatus,
        last_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), DieselError> {
        let t = self.table();
        let sql = format!(
            "INSERT INTO {t} (entity_id, status, attempts, last_attempt_at, created_at, updated_at) \
             VALUES (?1, ?2, 0, ?3, ?4, ?4) \
             ON CONFLICT(entity_id) DO UPDATE SET \
               status = excluded.status, \
               last_attempt_at = COALESCE(excluded.last_attempt_at, {t}.last_attempt_at), \
               claimed_at = CASE WHEN excluded.status = 'in_progress' THEN {t}.claimed_at ELSE NULL END, \
               updated_at = max({t}.updated_at, excluded.updated_at)"
        );
        let now = format_timestamp(Utc::now());
        let last_attempt = last_attempt_at.map(format_timestamp);

        with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<BigInt, _>(entity_id)
                .bind::<Text, _>(status.as_str())
                .bind::<Nullable<Text>, _>(last_attempt.as_deref())
                .bind::<Text, _>(&now)
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Insert the given ids with `status`, leaving existing rows untouched.
    ///
    /// Returns how many rows were created.
    pub async fn insert_absent(
        &self,
        entity_ids: &[i64],
        status: EntityStatus,
    ) -> Result<usize, DieselError> {
        if entity_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {} (entity_id, status, attempts, created_at, updated_at) \
             VALUES (?1, ?2, 0, ?3, ?3) \
             ON CONFLICT(entity_id) DO NOTHING",
            self.table()
        );
        let now = format_timestamp(Utc::now());
        let ids = entity_ids.to_vec();

        with_conn!(self.pool, conn, {
            conn.transaction(|conn| {
                Box::pin(async move {
                    let mut inserted = 0;
                    for id in ids {
                        inserted += diesel::sql_query(&sql)
                            .bind::<BigInt, _>(id)
                            .bind::<Text, _>(status.as_str())
                            .bind::<Text, _>(&now)
                            .execute(conn)
                            .await?;
                    }
                    Ok::<usize, DieselError>(inserted)
                })
            })
            .await
        })
    }

    /// Set status, stamp the attempt time and merge `extra` into the payload.
    ///
    /// Creates the row when absent; a created row starts with one attempt if
    /// `increment_attempt` is set.
    pub async fn mark(
        &self,
        entity_id: i64,
        status: EntityStatus,
        increment_attempt: bool,
        extra: &Map<String, Value>,
    ) -> Result<(), DieselError> {
        let t = self.table();
        let sql = format!(
            "INSERT INTO {t} (entity_id, status, attempts, last_attempt_at, created_at, updated_at, payload) \
             VALUES (?1, ?2, ?3, ?4, ?4, ?4, json(?5)) \
             ON CONFLICT(entity_id) DO UPDATE SET \
               status = excluded.status, \
               attempts = {t}.attempts + ?3, \
               last_attempt_at = excluded.last_attempt_at, \
               claimed_at = CASE WHEN excluded.status = 'in_progress' THEN {t}.claimed_at ELSE NULL END, \
               updated_at = max({t}.updated_at, excluded.updated_at), \
               payload = json_patch({t}.payload, excluded.payload)"
        );
        let now = format_timestamp(Utc::now());
        let payload = payload_json(extra);

        with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<BigInt, _>(entity_id)
                .bind::<Text, _>(status.as_str())
                .bind::<Integer, _>(i32::from(increment_attempt))
                .bind::<Text, _>(&now)
                .bind::<Text, _>(&payload)
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Apply `change` only if the entity is currently in `from`.
    ///
    /// Returns the attempt count after the change, or `None` when the guard
    /// did not match (missing row or different status).
    pub async fn transition(
        &self,
        entity_id: i64,
        from: EntityStatus,
        change: &Transition,
    ) -> Result<Option<u32>, DieselError> {
        self.transition_at(entity_id, from, change, Utc::now()).await
    }

    pub async fn transition_at(
        &self,
        entity_id: i64,
        from: EntityStatus,
        change: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, DieselError> {
        debug_assert!(
            from.can_transition(change.to),
            "illegal transition {} -> {}",
            from,
            change.to
        );
        let sql = format!(
            "UPDATE {} SET \
               status = ?1, \
               attempts = attempts + ?2, \
               failure_reason = ?3, \
               last_error = COALESCE(?4, last_error), \
               last_attempt_at = ?5, \
               claimed_at = NULL, \
               updated_at = max(updated_at, ?5), \
               payload = json_patch(payload, ?6) \
             WHERE entity_id = ?7 AND status = ?8 \
             RETURNING attempts",
            self.table()
        );
        let now = format_timestamp(now);
        let payload = payload_json(&change.extra);
        let reason = change.reason.map(|r| r.as_str());

        let rows: Vec<AttemptsRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(change.to.as_str())
                .bind::<Integer, _>(i32::from(change.increment_attempt))
                .bind::<Nullable<Text>, _>(reason)
                .bind::<Nullable<Text>, _>(change.error.as_deref())
                .bind::<Text, _>(&now)
                .bind::<Text, _>(&payload)
                .bind::<BigInt, _>(entity_id)
                .bind::<Text, _>(from.as_str())
                .load(&mut conn)
                .await?
        });

        Ok(rows.into_iter().next().map(|r| r.attempts.max(0) as u32))
    }

    /// Record a transient failure of an `in_progress` entity.
    ///
    /// Increments attempts and, in the same statement, sends the entity back to
    /// `pending` when `requeue` is set and budget remains, otherwise leaves it
    /// `failed`. Returns the new attempt count and status, or `None` when the
    /// entity was not `in_progress`.
    pub async fn record_transient_failure(
        &self,
        entity_id: i64,
        max_attempts: u32,
        requeue: bool,
        error: &str,
    ) -> Result<Option<(u32, EntityStatus)>, DieselError> {
        let sql = format!(
            "UPDATE {} SET \
               attempts = attempts + 1, \
               status = CASE WHEN ?1 = 1 AND attempts + 1 < ?2 THEN 'pending' ELSE 'failed' END, \
               failure_reason = 'transient', \
               last_error = ?3, \
               last_attempt_at = ?4, \
               claimed_at = NULL, \
               updated_at = max(updated_at, ?4) \
             WHERE entity_id = ?5 AND status = 'in_progress' \
             RETURNING attempts, status",
            self.table()
        );
        let now = format_timestamp(Utc::now());

        let rows: Vec<FailureRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Integer, _>(i32::from(requeue))
                .bind::<Integer, _>(max_attempts as i32)
                .bind::<Text, _>(error)
                .bind::<Text, _>(&now)
                .bind::<BigInt, _>(entity_id)
                .load(&mut conn)
                .await?
        });

        rows.into_iter()
            .next()
            .map(|r| {
                let status = EntityStatus::from_str(&r.status).ok_or_else(|| {
                    DieselError::DeserializationError(
                        format!("Invalid entity status: '{}'", r.status).into(),
                    )
                })?;
                Ok((r.attempts.max(0) as u32, status))
            })
            .transpose()
    }

    /// Claim up to `limit` entities in creation order.
    ///
    /// Pending entities are always eligible. With a retry window, `awaiting`
    /// and transient `failed` entities whose cooldown has elapsed and whose
    /// attempts are below the maximum are eligible too. Selection and marking
    /// happen in one statement, so two callers never receive the same id.
    pub async fn claim_batch(
        &self,
        limit: usize,
        retry: Option<RetryWindow>,
    ) -> Result<Vec<i64>, DieselError> {
        self.claim_batch_at(limit, retry, Utc::now()).await
    }

    pub async fn claim_batch_at(
        &self,
        limit: usize,
        retry: Option<RetryWindow>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, DieselError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let t = self.table();
        let sql = format!(
            "UPDATE {t} SET status = 'in_progress', claimed_at = ?1, updated_at = max(updated_at, ?1) \
             WHERE entity_id IN ( \
               SELECT entity_id FROM {t} \
               WHERE status = 'pending' \
                  OR (?2 = 1 \
                      AND status IN ('awaiting', 'failed') \
                      AND attempts < ?3 \
                      AND (failure_reason IS NULL OR failure_reason = 'transient') \
                      AND (last_attempt_at IS NULL OR last_attempt_at <= ?4)) \
               ORDER BY created_at, seq \
               LIMIT ?5) \
             RETURNING entity_id, created_at, seq"
        );
        let (enabled, max_attempts, cutoff) = match retry {
            Some(window) => (1, window.max_attempts as i32, now - window.cooldown),
            None => (0, 0, now),
        };
        let now_s = format_timestamp(now);
        let cutoff_s = format_timestamp(cutoff);
        let limit = limit as i64;
        let (sql, now_s, cutoff_s) = (sql.as_str(), now_s.as_str(), cutoff_s.as_str());

        let mut claimed: Vec<ClaimedRecord> = retry_on_busy("claim_batch", move || async move {
            with_conn!(self.pool, conn, {
                diesel::sql_query(sql)
                    .bind::<Text, _>(now_s)
                    .bind::<Integer, _>(enabled)
                    .bind::<Integer, _>(max_attempts)
                    .bind::<Text, _>(cutoff_s)
                    .bind::<BigInt, _>(limit)
                    .load(&mut conn)
                    .await
            })
        })
        .await?;

        claimed.sort_by(|a, b| (&a.created_at, a.seq).cmp(&(&b.created_at, b.seq)));
        Ok(claimed.into_iter().map(|r| r.entity_id).collect())
    }

    /// Claim one specific pending entity. Returns false if it was not pending.
    pub async fn claim_one(&self, entity_id: i64) -> Result<bool, DieselError> {
        let sql = format!(
            "UPDATE {} SET status = 'in_progress', claimed_at = ?1, updated_at = max(updated_at, ?1) \
             WHERE entity_id = ?2 AND status = 'pending' \
             RETURNING entity_id",
            self.table()
        );
        let now = format_timestamp(Utc::now());
        let (sql, now) = (sql.as_str(), now.as_str());

        let rows: Vec<EntityIdRecord> = retry_on_busy("claim_one", move || async move {
            with_conn!(self.pool, conn, {
                diesel::sql_query(sql)
                    .bind::<Text, _>(now)
                    .bind::<BigInt, _>(entity_id)
                    .load(&mut conn)
                    .await
            })
        })
        .await?;

        Ok(!rows.is_empty())
    }

    /// Return claims older than `timeout` to `pending`.
    pub async fn reap_stale(&self, timeout: Duration) -> Result<Vec<i64>, DieselError> {
        self.reap_stale_at(timeout, Utc::now()).await
    }

    pub async fn reap_stale_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, DieselError> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', claimed_at = NULL, updated_at = max(updated_at, ?1) \
             WHERE status = 'in_progress' AND (claimed_at IS NULL OR claimed_at <= ?2) \
             RETURNING entity_id",
            self.table()
        );
        let now_s = format_timestamp(now);
        let cutoff = format_timestamp(now - timeout);

        let rows: Vec<EntityIdRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(&now_s)
                .bind::<Text, _>(&cutoff)
                .load(&mut conn)
                .await?
        });

        let mut ids: Vec<i64> = rows.into_iter().map(|r| r.entity_id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn get(&self, entity_id: i64) -> Result<Option<Entity>, DieselError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE entity_id = ?1",
            ENTITY_COLUMNS,
            self.table()
        );
        let rows: Vec<EntityRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<BigInt, _>(entity_id)
                .load(&mut conn)
                .await?
        });
        rows.into_iter().next().map(Entity::try_from).transpose()
    }

    pub async fn exists(&self, entity_id: i64) -> Result<bool, DieselError> {
        let sql = format!(
            "SELECT entity_id FROM {} WHERE entity_id = ?1",
            self.table()
        );
        let rows: Vec<EntityIdRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<BigInt, _>(entity_id)
                .load(&mut conn)
                .await?
        });
        Ok(!rows.is_empty())
    }

    /// Ids in any of `statuses`, optionally below an attempt bound, oldest first.
    pub async fn list_ids(
        &self,
        statuses: &[EntityStatus],
        max_attempts: Option<u32>,
    ) -> Result<Vec<i64>, DieselError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT entity_id FROM {} WHERE status IN ({}) AND (?1 IS NULL OR attempts < ?1) \
             ORDER BY created_at, seq",
            self.table(),
            status_list(statuses)
        );
        let bound = max_attempts.map(|m| m as i32);

        let rows: Vec<EntityIdRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Nullable<Integer>, _>(bound)
                .load(&mut conn)
                .await?
        });
        Ok(rows.into_iter().map(|r| r.entity_id).collect())
    }

    /// Ids in `status` that are eligible for another attempt now.
    pub async fn list_for_retry(
        &self,
        status: EntityStatus,
        max_attempts: u32,
        cooldown: Duration,
    ) -> Result<Vec<i64>, DieselError> {
        self.list_for_retry_at(status, max_attempts, cooldown, Utc::now())
            .await
    }

    pub async fn list_for_retry_at(
        &self,
        status: EntityStatus,
        max_attempts: u32,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, DieselError> {
        let sql = format!(
            "SELECT entity_id FROM {} \
             WHERE status = ?1 AND attempts < ?2 \
               AND (failure_reason IS NULL OR failure_reason = 'transient') \
               AND (last_attempt_at IS NULL OR last_attempt_at <= ?3) \
             ORDER BY created_at, seq",
            self.table()
        );
        let cutoff = format_timestamp(now - cooldown);

        let rows: Vec<EntityIdRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(status.as_str())
                .bind::<Integer, _>(max_attempts as i32)
                .bind::<Text, _>(&cutoff)
                .load(&mut conn)
                .await?
        });
        Ok(rows.into_iter().map(|r| r.entity_id).collect())
    }

    /// Number of entities per status, in lifecycle order, zeros included.
    pub async fn counts(&self) -> Result<Vec<(EntityStatus, i64)>, DieselError> {
        let sql = format!(
            "SELECT status, COUNT(*) AS count FROM {} GROUP BY status",
            self.table()
        );
        let rows: Vec<StatusCountRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql).load(&mut conn).await?
        });

        Ok(EntityStatus::ALL
            .iter()
            .map(|status| {
                let count = rows
                    .iter()
                    .find(|r| r.status == status.as_str())
                    .map(|r| r.count)
                    .unwrap_or(0);
                (*status, count)
            })
            .collect())
    }

    pub async fn max_id(&self) -> Result<Option<i64>, DieselError> {
        let sql = format!("SELECT MAX(entity_id) AS value FROM {}", self.table());
        let rows: Vec<OptionalIdRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql).load(&mut conn).await?
        });
        Ok(rows.into_iter().next().and_then(|r| r.value))
    }

    /// Every known id in ascending order.
    pub async fn all_ids(&self) -> Result<Vec<i64>, DieselError> {
        let sql = format!(
            "SELECT entity_id FROM {} ORDER BY entity_id",
            self.table()
        );
        let rows: Vec<EntityIdRecord> = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql).load(&mut conn).await?
        });
        Ok(rows.into_iter().map(|r| r.entity_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::migrations;
    use tempfile::tempdir;

    async fn store(stage: Stage) -> (tempfile::TempDir, StatusStore) {
        let dir = tempdir().unwrap();
        let db_url = format!("sqlite:{}", dir.path().join("test.db").display());
        migrations::run_migrations(&db_url).await.unwrap();
        let pool = DbPool::from_url(&db_url).unwrap();
        (dir, StatusStore::new(pool, stage))
    }

    #[tokio::test]
    async fn test_upsert_never_touches_attempts() {
        let (_dir, store) = store(Stage::Download).await;

        store.mark(7, EntityStatus::Failed, true, &Map::new()).await.unwrap();
        store.upsert(7, EntityStatus::Awaiting, None).await.unwrap();

        let entity = store.get(7).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Awaiting);
        assert_eq!(entity.attempts, 1);
        assert!(entity.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_creates_missing_row_and_merges_payload() {
        let (_dir, store) = store(Stage::Download).await;

        let mut first = Map::new();
        first.insert("apelido".into(), Value::from("ACME"));
        store.mark(3, EntityStatus::Failed, true, &first).await.unwrap();

        let mut second = Map::new();
        second.insert("anexos_total".into(), Value::from(4));
        store.mark(3, EntityStatus::Done, false, &second).await.unwrap();

        let entity = store.get(3).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Done);
        assert_eq!(entity.attempts, 1);
        assert_eq!(entity.payload_str("apelido"), Some("ACME"));
        assert_eq!(entity.payload["anexos_total"], 4);
        assert!(entity.updated_at >= entity.created_at);
    }

    #[tokio::test]
    async fn test_insert_absent_keeps_existing_rows() {
        let (_dir, store) = store(Stage::Triage).await;

        store.mark(2, EntityStatus::Failed, true, &Map::new()).await.unwrap();
        let inserted = store
            .insert_absent(&[1, 2, 3], EntityStatus::Pending)
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let two = store.get(2).await.unwrap().unwrap();
        assert_eq!(two.status, EntityStatus::Failed);
        assert_eq!(two.attempts, 1);
        assert_eq!(store.all_ids().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_list_ids_orders_by_creation() {
        let (_dir, store) = store(Stage::Download).await;

        for id in [30, 10, 20] {
            store.upsert(id, EntityStatus::Pending, None).await.unwrap();
        }
        store.mark(10, EntityStatus::Failed, true, &Map::new()).await.unwrap();

        assert_eq!(
            store.list_ids(&[EntityStatus::Pending], None).await.unwrap(),
            vec![30, 20]
        );
        assert_eq!(
            store
                .list_ids(&[EntityStatus::Pending, EntityStatus::Failed], Some(1))
                .await
                .unwrap(),
            vec![30, 20]
        );
        assert_eq!(store.max_id().await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_transition_is_guarded_by_source_status() {
        let (_dir, store) = store(Stage::Tomados).await;
        store.upsert(5, EntityStatus::Pending, None).await.unwrap();

        let done = Transition::to(EntityStatus::Done);
        assert_eq!(store.transition(5, EntityStatus::InProgress, &done).await.unwrap(), None);

        assert!(store.claim_one(5).await.unwrap());
        assert!(!store.claim_one(5).await.unwrap());
        assert_eq!(
            store.transition(5, EntityStatus::InProgress, &done).await.unwrap(),
            Some(0)
        );

        let entity = store.get(5).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Done);
        assert!(entity.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_never_retried() {
        let (_dir, store) = store(Stage::Download).await;
        store.upsert(9, EntityStatus::Pending, None).await.unwrap();
        store.claim_one(9).await.unwrap();

        let change = Transition::to(EntityStatus::Failed)
            .failed(FailureReason::AttachmentLimit, "61 attachments");
        let attempts = store
            .transition(9, EntityStatus::InProgress, &change)
            .await
            .unwrap();
        assert_eq!(attempts, Some(0));

        let later = Utc::now() + Duration::days(30);
        let retry = store
            .list_for_retry_at(EntityStatus::Failed, 3, Duration::minutes(15), later)
            .await
            .unwrap();
        assert!(retry.is_empty());

        let window = RetryWindow {
            max_attempts: 3,
            cooldown: Duration::minutes(15),
        };
        let claimed = store.claim_batch_at(10, Some(window), later).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_reaper_only_returns_stale_claims() {
        let (_dir, store) = store(Stage::Triage).await;
        store
            .insert_absent(&[1, 2], EntityStatus::Pending)
            .await
            .unwrap();
        assert_eq!(store.claim_batch(2, None).await.unwrap(), vec![1, 2]);

        let reaped = store
            .reap_stale_at(Duration::minutes(90), Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        assert!(reaped.is_empty());

        let reaped = store
            .reap_stale_at(Duration::minutes(90), Utc::now() + Duration::minutes(91))
            .await
            .unwrap();
        assert_eq!(reaped, vec![1, 2]);

        let one = store.get(1).await.unwrap().unwrap();
        assert_eq!(one.status, EntityStatus::Pending);
        assert!(one.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_counts_include_every_status() {
        let (_dir, store) = store(Stage::Download).await;
        store.insert_absent(&[1, 2, 3], EntityStatus::Pending).await.unwrap();
        store.mark(3, EntityStatus::Done, false, &Map::new()).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.len(), EntityStatus::ALL.len());
        assert!(counts.contains(&(EntityStatus::Pending, 2)));
        assert!(counts.contains(&(EntityStatus::Done, 1)));
        assert!(counts.contains(&(EntityStatus::Failed, 0)));
    }

    async fn seed_failed(
        store: &StatusStore,
        entity_id: i64,
        attempts: i32,
        reason: Option<FailureReason>,
        last_attempt_at: Option<DateTime<Utc>>,
    ) {
        let sql = format!(
            "INSERT INTO {} (entity_id, status, attempts, failure_reason, last_attempt_at, created_at, updated_at) \
             VALUES (?1, 'failed', ?2, ?3, ?4, ?5, ?5)",
            store.table()
        );
        let created = format_timestamp(Utc::now());
        let last = last_attempt_at.map(format_timestamp);
        let reason = reason.map(|r| r.as_str());
        let inserted: Result<usize, DieselError> = async {
            with_conn!(store.pool, conn, {
                diesel::sql_query(&sql)
                    .bind::<BigInt, _>(entity_id)
                    .bind::<Integer, _>(attempts)
                    .bind::<Nullable<Text>, _>(reason)
                    .bind::<Nullable<Text>, _>(last.as_deref())
                    .bind::<Text, _>(&created)
                    .execute(&mut conn)
                    .await
            })
        }
        .await;
        assert_eq!(inserted.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_selection_agrees_with_policy() {
        use crate::policy::RetryPolicy;
        use chrono::TimeZone;

        let (_dir, store) = store(Stage::Download).await;
        let policy = RetryPolicy::new(3, Duration::minutes(15));
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();

        let reasons = [
            None,
            Some(FailureReason::Transient),
            Some(FailureReason::FileLimit),
            Some(FailureReason::MissingSource),
        ];
        let ages = [None, Some(0), Some(5), Some(14), Some(15), Some(16), Some(120)];

        let mut id = 0;
        for attempts in [0, 1, 2, 3, 4] {
            for reason in reasons {
                for age in ages {
                    id += 1;
                    let last = age.map(|m| now - Duration::minutes(m));
                    seed_failed(&store, id, attempts, reason, last).await;
                }
            }
        }

        let mut expected = Vec::new();
        for entity_id in store.all_ids().await.unwrap() {
            let e = store.get(entity_id).await.unwrap().unwrap();
            if policy.is_eligible(e.attempts, e.last_attempt_at, e.failure_reason, now) {
                expected.push(entity_id);
            }
        }
        assert!(!expected.is_empty());
        assert!(expected.len() < id as usize);

        let listed = store
            .list_for_retry_at(EntityStatus::Failed, policy.max_attempts, policy.cooldown, now)
            .await
            .unwrap();
        assert_eq!(listed, expected);

        let window = RetryWindow {
            max_attempts: policy.max_attempts,
            cooldown: policy.cooldown,
        };
        let claimed = store.claim_batch_at(1000, Some(window), now).await.unwrap();
        assert_eq!(claimed, expected);
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "illegal transition done -> pending")]
    async fn test_transition_rejects_lifecycle_violations() {
        let (_dir, store) = store(Stage::Tomados).await;
        store.mark(4, EntityStatus::Done, false, &Map::new()).await.unwrap();
        let _ = store
            .transition(4, EntityStatus::Done, &Transition::to(EntityStatus::Pending))
            .await;
    }
}
