//! Per-OS lifecycle models shared by every stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an OS within one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Known and waiting to be claimed.
    Pending,
    /// The external resource was not ready yet; retried after the cooldown.
    Awaiting,
    /// Claimed by a worker.
    InProgress,
    Done,
    Failed,
}

impl EntityStatus {
    pub const ALL: [EntityStatus; 5] = [
        EntityStatus::Pending,
        EntityStatus::Awaiting,
        EntityStatus::InProgress,
        EntityStatus::Done,
        EntityStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Awaiting => "awaiting",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "awaiting" => Some(Self::Awaiting),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    ///
    /// `Failed -> Pending` is only reachable through an administrative reseed.
    pub fn can_transition(&self, to: EntityStatus) -> bool {
        use EntityStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Awaiting, InProgress)
                | (Failed, InProgress)
                | (InProgress, Done)
                | (InProgress, Awaiting)
                | (InProgress, Pending)
                | (InProgress, Failed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of failure reasons recorded on an entity.
///
/// Retry decisions are made from this code only; free-text error details are
/// stored separately and never parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Network, timeout, I/O or collaborator error. Retryable.
    Transient,
    /// The OS carries more attachments than the configured maximum.
    AttachmentLimit,
    /// Too many files after unpacking.
    FileLimit,
    /// The folder or input this stage needs does not exist.
    MissingSource,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::AttachmentLimit => "attachment_limit",
            Self::FileLimit => "file_limit",
            Self::MissingSource => "missing_source",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "attachment_limit" => Some(Self::AttachmentLimit),
            "file_limit" => Some(Self::FileLimit),
            "missing_source" => Some(Self::MissingSource),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure observed while processing one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl Failure {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::Transient,
            detail: detail.into(),
        }
    }

    pub fn permanent(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

/// One OS row in a stage's status table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: i64,
    pub status: EntityStatus,
    /// Failed attempts so far. Never decremented.
    pub attempts: u32,
    pub failure_reason: Option<FailureReason>,
    /// Human-readable detail of the last failure.
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set while the entity is `in_progress`.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stage-specific result fields.
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip() {
        for status in EntityStatus::ALL {
            assert_eq!(EntityStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(EntityStatus::from_str("sucesso"), None);
    }

    #[test]
    fn test_allowed_transitions() {
        use EntityStatus::*;
        assert!(Pending.can_transition(InProgress));
        assert!(InProgress.can_transition(Awaiting));
        assert!(Failed.can_transition(Pending));
        assert!(!Done.can_transition(Pending));
        assert!(!Done.can_transition(InProgress));
        assert!(!Pending.can_transition(Done));
        assert!(!Awaiting.can_transition(Failed));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(FailureReason::Transient.is_retryable());
        for reason in [
            FailureReason::AttachmentLimit,
            FailureReason::FileLimit,
            FailureReason::MissingSource,
        ] {
            assert!(!reason.is_retryable());
            assert_eq!(FailureReason::from_str(reason.as_str()), Some(reason));
        }
    }
}
