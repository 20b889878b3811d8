//! Domain models.

mod entity;
mod service_status;
mod stage;

pub use entity::{Entity, EntityStatus, Failure, FailureReason};
pub use service_status::{CycleStats, ServiceState, ServiceStatus};
pub use stage::{RetryMode, Stage, TOMADOS_QUEUE, TRIAGE_QUEUE};
