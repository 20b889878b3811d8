//! Cross-stage notifications.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::repository::{DieselError, DieselWorkQueue};

/// Tells a downstream stage that an entity is ready for it.
///
/// Delivery is at least once; receivers check the entity's status before
/// doing any work, so duplicates are harmless.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, entity_id: i64, metadata: &Map<String, Value>) -> Result<(), DieselError>;
}

/// Notifier that appends to a named durable queue.
///
/// Only the id travels; consumers locate the OS folder from it.
#[derive(Clone)]
pub struct QueueNotifier {
    queue: DieselWorkQueue,
    name: String,
}

impl QueueNotifier {
    pub fn new(queue: DieselWorkQueue, name: impl Into<String>) -> Self {
        Self {
            queue,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Notifier for QueueNotifier {
    async fn notify(&self, entity_id: i64, metadata: &Map<String, Value>) -> Result<(), DieselError> {
        debug!(entity_id, queue = %self.name, ?metadata, "Publishing notification");
        self.queue.publish(&self.name, entity_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TOMADOS_QUEUE;
    use crate::repository::{migrations, DbContext};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_duplicate_notifications_both_land() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("osflow.db");
        migrations::run_migrations(&db.display().to_string())
            .await
            .unwrap();
        let ctx = DbContext::from_sqlite_path(&db).unwrap();

        let notifier = QueueNotifier::new(ctx.work_queue(), TOMADOS_QUEUE);
        notifier.notify(9, &Map::new()).await.unwrap();
        notifier.notify(9, &Map::new()).await.unwrap();

        assert_eq!(ctx.work_queue().len(TOMADOS_QUEUE).await.unwrap(), 2);
    }
}
