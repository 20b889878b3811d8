//! Work queue error types.

use thiserror::Error;

use crate::models::EntityStatus;

#[derive(Debug, Error)]
pub enum WorkQueueError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Entity {entity_id} is {status}, not claimable")]
    NotClaimable {
        entity_id: i64,
        status: EntityStatus,
    },
    #[error("Entity {entity_id} is no longer {expected}; transition to {to} rejected")]
    InvalidTransition {
        entity_id: i64,
        expected: EntityStatus,
        to: EntityStatus,
    },
    #[error("Entity not found: {0}")]
    NotFound(i64),
}
