//! Heartbeat records for running stage processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Stage;

/// Service status state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Starting,
    Running,
    Idle,
    Error,
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "idle" => Some(Self::Idle),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Counters reported by a stage after each cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub session_processed: u64,
    pub session_done: u64,
    pub session_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u64>,
}

/// Service status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Unique identifier, `<stage>:<host>`.
    pub id: String,
    pub stage: Stage,
    pub status: ServiceState,
    pub last_heartbeat: DateTime<Utc>,
    /// Last time an entity was actually processed.
    pub last_activity: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub stats: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub host: Option<String>,
    pub version: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Total error count for this session.
    pub error_count: i32,
}

impl ServiceStatus {
    pub fn new(stage: Stage) -> Self {
        let host = get_hostname();
        let id = format!("{}:{}", stage.as_str(), host.as_deref().unwrap_or("local"));
        Self {
            id,
            stage,
            status: ServiceState::Starting,
            last_heartbeat: Utc::now(),
            last_activity: None,
            current_task: None,
            stats: serde_json::json!({}),
            started_at: Utc::now(),
            host,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            last_error: None,
            last_error_at: None,
            error_count: 0,
        }
    }

    pub fn update_stats(&mut self, stats: &CycleStats) {
        self.stats = serde_json::to_value(stats).unwrap_or_default();
        self.last_heartbeat = Utc::now();
    }

    /// Mark as running with a task description.
    pub fn set_running(&mut self, task: Option<&str>) {
        self.status = ServiceState::Running;
        self.current_task = task.map(|s| s.to_string());
        self.last_heartbeat = Utc::now();
        self.last_activity = Some(Utc::now());
    }

    pub fn set_idle(&mut self) {
        self.status = ServiceState::Idle;
        self.current_task = None;
        self.last_heartbeat = Utc::now();
    }

    pub fn record_error(&mut self, error: &str) {
        self.status = ServiceState::Error;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
        self.error_count += 1;
        self.last_heartbeat = Utc::now();
    }

    pub fn set_stopped(&mut self) {
        self.status = ServiceState::Stopped;
        self.current_task = None;
        self.last_heartbeat = Utc::now();
    }

    /// Check if the service is stale (no heartbeat for given duration).
    pub fn is_stale(&self, threshold_secs: i64) -> bool {
        let age = Utc::now() - self.last_heartbeat;
        age.num_seconds() > threshold_secs
    }
}

fn get_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}
