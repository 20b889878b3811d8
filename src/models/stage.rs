//! Pipeline stage identifiers.
//!
//! Each stage owns one status table. Table and queue names are derived from
//! this closed set, never from user input, so they are safe to interpolate
//! into SQL.

use serde::{Deserialize, Serialize};

/// How a stage treats transient failures that still have retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Return the entity to `pending` immediately (queue-fed stages).
    Requeue,
    /// Leave the entity `failed` and let the cooldown gate the next claim.
    Cooldown,
}

/// A processing stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Triage,
    Tomados,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Download, Stage::Triage, Stage::Tomados];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Triage => "triage",
            Self::Tomados => "tomados",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "download" | "downloader" => Some(Self::Download),
            "triage" | "triagem" => Some(Self::Triage),
            "tomados" => Some(Self::Tomados),
            _ => None,
        }
    }

    /// Status table backing this stage.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Download => "os_downloads",
            Self::Triage => "os_triage",
            Self::Tomados => "os_tomados",
        }
    }

    /// Name of the queue this stage consumes, if it is queue-fed.
    pub fn inbound_queue(&self) -> Option<&'static str> {
        match self {
            Self::Download => None,
            Self::Triage => Some(TRIAGE_QUEUE),
            Self::Tomados => Some(TOMADOS_QUEUE),
        }
    }

    pub fn retry_mode(&self) -> RetryMode {
        match self {
            Self::Download => RetryMode::Cooldown,
            Self::Triage | Self::Tomados => RetryMode::Requeue,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue between the downloader and the triage worker.
pub const TRIAGE_QUEUE: &str = "triage";

/// Queue carrying notifications from triage to the tomados stage.
pub const TOMADOS_QUEUE: &str = "tomados";
