//! Repository layer for database persistence.
//!
//! All stage processes share one SQLite database: a status table per stage,
//! the `work_queue` hand-off table and the `service_status` heartbeats.

pub mod context;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod service_status;
pub mod status_store;
pub mod util;

pub use context::DbContext;
pub use pool::{DbPool, DieselError};
pub use queue::DieselWorkQueue;
pub use service_status::DieselServiceStatusRepository;
pub use status_store::{RetryWindow, StatusStore, Transition};

use chrono::{DateTime, Utc};

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}
