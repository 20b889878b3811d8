//! Database record types.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Text};

use crate::schema::{service_status, work_queue};

/// Full row of a stage status table.
#[derive(Debug, Clone, QueryableByName)]
pub struct EntityRecord {
    #[diesel(sql_type = BigInt)]
    pub entity_id: i64,
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = Integer)]
    pub attempts: i32,
    #[diesel(sql_type = Nullable<Text>)]
    pub failure_reason: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_error: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_attempt_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub claimed_at: Option<String>,
    #[diesel(sql_type = Text)]
    pub created_at: String,
    #[diesel(sql_type = Text)]
    pub updated_at: String,
    #[diesel(sql_type = Text)]
    pub payload: String,
}

#[derive(Debug, QueryableByName)]
pub struct EntityIdRecord {
    #[diesel(sql_type = BigInt)]
    pub entity_id: i64,
}

/// Row returned by a claim, carrying its ordering keys.
#[derive(Debug, QueryableByName)]
pub struct ClaimedRecord {
    #[diesel(sql_type = BigInt)]
    pub entity_id: i64,
    #[diesel(sql_type = Text)]
    pub created_at: String,
    #[diesel(sql_type = BigInt)]
    pub seq: i64,
}

#[derive(Debug, QueryableByName)]
pub struct StatusCountRecord {
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

#[derive(Debug, QueryableByName)]
pub struct OptionalIdRecord {
    #[diesel(sql_type = Nullable<BigInt>)]
    pub value: Option<i64>,
}

#[derive(Debug, QueryableByName)]
pub struct AttemptsRecord {
    #[diesel(sql_type = Integer)]
    pub attempts: i32,
}

/// Attempt count and resulting status after a transient failure.
#[derive(Debug, QueryableByName)]
pub struct FailureRecord {
    #[diesel(sql_type = Integer)]
    pub attempts: i32,
    #[diesel(sql_type = Text)]
    pub status: String,
}

/// Queue item record.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = work_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueueItemRecord {
    pub seq: i64,
    pub queue: String,
    pub entity_id: i64,
    pub enqueued_at: String,
}

/// Service status record.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = service_status)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ServiceStatusRecord {
    pub id: String,
    pub service_type: String,
    pub status: String,
    pub last_heartbeat: String,
    pub last_activity: Option<String>,
    pub current_task: Option<String>,
    pub stats: String,
    pub started_at: String,
    pub host: Option<String>,
    pub version: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
    pub error_count: i32,
}

/// New service status record for upserts.
#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = service_status)]
#[diesel(treat_none_as_null = true)]
pub struct NewServiceStatus<'a> {
    pub id: &'a str,
    pub service_type: &'a str,
    pub status: &'a str,
    pub last_heartbeat: &'a str,
    pub last_activity: Option<&'a str>,
    pub current_task: Option<&'a str>,
    pub stats: &'a str,
    pub started_at: &'a str,
    pub host: Option<&'a str>,
    pub version: Option<&'a str>,
    pub last_error: Option<&'a str>,
    pub last_error_at: Option<&'a str>,
    pub error_count: i32,
}
