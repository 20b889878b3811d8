//! SQLite connection handling.
//!
//! Every stage process talks to the same database file, so each connection
//! waits on the write lock instead of failing immediately.

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};

use super::util::to_diesel_error;

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// Async SQLite connection type.
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// How long a connection waits for a competing writer before giving up.
pub const BUSY_TIMEOUT_MS: u32 = 30_000;

/// SQLite connection pool (lightweight - creates connections on demand).
#[derive(Clone)]
pub struct SqlitePool {
    database_url: String,
}

impl SqlitePool {
    pub fn new(database_url: &str) -> Self {
        // Strip sqlite: prefix if present
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        Self {
            database_url: url.to_string(),
        }
    }

    /// Open a connection with the per-connection pragmas applied.
    pub async fn get(&self) -> Result<SqliteConn, DieselError> {
        let mut conn = SqliteConn::establish(&self.database_url)
            .await
            .map_err(to_diesel_error)?;
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            BUSY_TIMEOUT_MS
        ))
        .await?;
        Ok(conn)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

/// Database pool handed to every repository.
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
}

impl DbPool {
    /// Create a pool from a database URL (`sqlite:path` or a bare path).
    pub fn from_url(url: &str) -> Result<Self, DieselError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Err(to_diesel_error(format!(
                "unsupported database URL '{}': only SQLite is supported",
                url
            )));
        }
        Ok(DbPool::Sqlite(SqlitePool::new(url)))
    }

    pub fn database_url(&self) -> &str {
        match self {
            DbPool::Sqlite(pool) => pool.database_url(),
        }
    }
}

/// Run database operations with a fresh connection from the pool.
///
/// # Example
/// ```ignore
/// with_conn!(self.pool, conn, {
///     work_queue::table.count().get_result::<i64>(&mut conn).await
/// })
/// ```
#[macro_export]
macro_rules! with_conn {
    ($pool:expr, $conn:ident, $body:expr) => {{
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
        }
    }};
}

#[allow(unused_imports)]
pub use with_conn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_detection() {
        let pool = DbPool::from_url("sqlite:/path/to/db").unwrap();
        assert_eq!(pool.database_url(), "/path/to/db");
        assert!(DbPool::from_url("/path/to/db.sqlite").is_ok());
        assert!(DbPool::from_url("postgres://localhost/osflow").is_err());
    }
}
