//! Database context: owns the pool and hands out repositories.

use std::path::Path;

use super::pool::{DbPool, DieselError};
use super::queue::DieselWorkQueue;
use super::service_status::DieselServiceStatusRepository;
use super::status_store::StatusStore;
use crate::models::Stage;
use crate::with_conn;

/// Create one context per command or stage process, then use it to access
/// every repository.
///
/// # Example
/// ```ignore
/// let ctx = DbContext::from_url("sqlite:/var/lib/osflow/osflow.db")?;
/// let pending = ctx.status_store(Stage::Download).list_ids(&[EntityStatus::Pending], None).await?;
/// ```
#[derive(Clone)]
pub struct DbContext {
    pool: DbPool,
}

impl DbContext {
    pub fn from_url(database_url: &str) -> Result<Self, DieselError> {
        let pool = DbPool::from_url(database_url)?;
        Ok(Self { pool })
    }

    pub fn from_sqlite_path(db_path: &Path) -> Result<Self, DieselError> {
        let url = format!("sqlite:{}", db_path.display());
        Self::from_url(&url)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn status_store(&self, stage: Stage) -> StatusStore {
        StatusStore::new(self.pool.clone(), stage)
    }

    pub fn work_queue(&self) -> DieselWorkQueue {
        DieselWorkQueue::new(self.pool.clone())
    }

    pub fn service_status(&self) -> DieselServiceStatusRepository {
        DieselServiceStatusRepository::new(self.pool.clone())
    }

    /// Test that the database connection works.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn test_connection(&self) -> Result<(), DieselError> {
        with_conn!(self.pool, _conn, Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityStatus;
    use crate::repository::migrations;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_context_shares_one_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        migrations::run_migrations(&format!("sqlite:{}", db_path.display()))
            .await
            .unwrap();

        let ctx = DbContext::from_sqlite_path(&db_path).unwrap();
        ctx.test_connection().await.unwrap();

        ctx.status_store(Stage::Download)
            .upsert(1, EntityStatus::Pending, None)
            .await
            .unwrap();
        assert!(ctx.status_store(Stage::Download).exists(1).await.unwrap());
        assert!(!ctx.status_store(Stage::Triage).exists(1).await.unwrap());
        assert!(ctx.work_queue().is_empty("triage").await.unwrap());
    }
}
