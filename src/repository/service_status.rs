//! Diesel-based service status repository.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::models::{NewServiceStatus, ServiceStatusRecord};
use super::pool::{DbPool, DieselError};
use super::util::format_timestamp;
use super::{parse_datetime, parse_datetime_opt};
use crate::models::{ServiceState, ServiceStatus, Stage};
use crate::schema::service_status;
use crate::with_conn;

/// Convert a database record to a domain model.
impl TryFrom<ServiceStatusRecord> for ServiceStatus {
    type Error = DieselError;

    fn try_from(record: ServiceStatusRecord) -> Result<Self, Self::Error> {
        let stats = serde_json::from_str(&record.stats)
            .map_err(|e| DieselError::DeserializationError(Box::new(e)))?;

        Ok(ServiceStatus {
            id: record.id,
            stage: Stage::from_str(&record.service_type).ok_or_else(|| {
                DieselError::DeserializationError(
                    format!("Invalid service_type: '{}'", record.service_type).into(),
                )
            })?,
            status: ServiceState::from_str(&record.status).ok_or_else(|| {
                DieselError::DeserializationError(
                    format!("Invalid service state: '{}'", record.status).into(),
                )
            })?,
            last_heartbeat: parse_datetime(&record.last_heartbeat),
            last_activity: parse_datetime_opt(record.last_activity),
            current_task: record.current_task,
            stats,
            started_at: parse_datetime(&record.started_at),
            host: record.host,
            version: record.version,
            last_error: record.last_error,
            last_error_at: parse_datetime_opt(record.last_error_at),
            error_count: record.error_count,
        })
    }
}

#[derive(Clone)]
pub struct DieselServiceStatusRepository {
    pool: DbPool,
}

impl DieselServiceStatusRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_all(&self) -> Result<Vec<ServiceStatus>, DieselError> {
        with_conn!(self.pool, conn, {
            service_status::table
                .order(service_status::id.asc())
                .select(ServiceStatusRecord::as_select())
                .load(&mut conn)
                .await
                .and_then(|records| records.into_iter().map(ServiceStatus::try_from).collect())
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<ServiceStatus>, DieselError> {
        with_conn!(self.pool, conn, {
            service_status::table
                .find(id)
                .select(ServiceStatusRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
                .and_then(|opt| opt.map(ServiceStatus::try_from).transpose())
        })
    }

    /// Insert or update a service status.
    pub async fn upsert(&self, status: &ServiceStatus) -> Result<(), DieselError> {
        let stats_json = serde_json::to_string(&status.stats).unwrap_or_else(|_| "{}".to_string());
        let last_heartbeat = format_timestamp(status.last_heartbeat);
        let last_activity = status.last_activity.map(format_timestamp);
        let started_at = format_timestamp(status.started_at);
        let last_error_at = status.last_error_at.map(format_timestamp);

        let record = NewServiceStatus {
            id: &status.id,
            service_type: status.stage.as_str(),
            status: status.status.as_str(),
            last_heartbeat: &last_heartbeat,
            last_activity: last_activity.as_deref(),
            current_task: status.current_task.as_deref(),
            stats: &stats_json,
            started_at: &started_at,
            host: status.host.as_deref(),
            version: status.version.as_deref(),
            last_error: status.last_error.as_deref(),
            last_error_at: last_error_at.as_deref(),
            error_count: status.error_count,
        };

        with_conn!(self.pool, conn, {
            diesel::insert_into(service_status::table)
                .values(&record)
                .on_conflict(service_status::id)
                .do_update()
                .set(&record)
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Delete stopped services with no heartbeat for the given seconds.
    pub async fn cleanup_stale(&self, threshold_secs: i64) -> Result<usize, DieselError> {
        let cutoff =
            format_timestamp(chrono::Utc::now() - chrono::Duration::seconds(threshold_secs));

        with_conn!(self.pool, conn, {
            diesel::delete(
                service_status::table
                    .filter(service_status::last_heartbeat.lt(&cutoff))
                    .filter(service_status::status.eq("stopped")),
            )
            .execute(&mut conn)
            .await
        })
    }
}
