//! Work handle: a claimed entity that must be resolved exactly once.

use chrono::{DateTime, Utc};

/// A claimed entity. Move semantics: consumed by `complete()`, `defer()` or
/// `fail()`.
///
/// If dropped without being consumed, logs a warning. The stale-claim reaper
/// is the real safety net; the warning is for debugging only.
#[derive(Debug)]
pub struct WorkHandle {
    entity_id: i64,
    claimed_at: DateTime<Utc>,
    consumed: bool,
}

impl WorkHandle {
    pub(crate) fn new(entity_id: i64) -> Self {
        Self {
            entity_id,
            claimed_at: Utc::now(),
            consumed: false,
        }
    }

    pub fn entity_id(&self) -> i64 {
        self.entity_id
    }

    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    /// Mark this handle as consumed (called internally by complete/defer/fail).
    pub(crate) fn consume(mut self) -> i64 {
        self.consumed = true;
        self.entity_id
    }
}

impl Drop for WorkHandle {
    fn drop(&mut self) {
        if !self.consumed {
            tracing::warn!(
                entity_id = self.entity_id,
                "WorkHandle dropped without being resolved; the claim stays until reaped"
            );
        }
    }
}
