//! Portal access: which OS ids exist and what each one carries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Portal unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata the portal shows for one OS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsMetadata {
    /// Client nickname ("apelido").
    #[serde(default, alias = "apelido")]
    pub nickname: String,
    #[serde(default, alias = "assunto")]
    pub subject: String,
    #[serde(default, alias = "descricao")]
    pub description: String,
}

/// An OS whose attachments are available locally.
#[derive(Debug, Clone)]
pub struct FetchedOs {
    pub entity_id: i64,
    pub metadata: OsMetadata,
    pub attachments: Vec<PathBuf>,
}

/// Result of fetching one OS.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedOs),
    /// The OS exists but is not ready yet.
    NotYetAvailable,
    /// Transient failure; the detail is for humans.
    Failed(String),
}

/// Source of OS ids and attachments.
#[async_trait]
pub trait Portal: Send + Sync {
    /// Highest OS id currently visible.
    async fn latest_id(&self) -> Result<i64, PortalError>;

    async fn fetch(&self, entity_id: i64) -> FetchOutcome;
}

/// Metadata file expected in each staged OS directory.
pub const METADATA_FILE: &str = "os.json";

/// Marker left in a directory while it is still being staged.
pub const PARTIAL_MARKER: &str = ".partial";

/// Portal backed by an inbox directory with one subdirectory per OS id.
///
/// ```text
/// inbox/
///   1042/
///     os.json          {"apelido": "...", "assunto": "...", "descricao": "..."}
///     nota.pdf
///     extrato.zip
/// ```
pub struct InboxPortal {
    inbox: PathBuf,
}

impl InboxPortal {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }
}

#[async_trait]
impl Portal for InboxPortal {
    async fn latest_id(&self) -> Result<i64, PortalError> {
        let mut entries = tokio::fs::read_dir(&self.inbox).await.map_err(|e| {
            PortalError::Unavailable(format!("cannot read inbox {}: {}", self.inbox.display(), e))
        })?;

        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok()) {
                latest = latest.max(Some(id));
            }
        }

        latest.ok_or_else(|| PortalError::Unavailable("inbox has no OS directories yet".into()))
    }

    async fn fetch(&self, entity_id: i64) -> FetchOutcome {
        let dir = self.inbox.join(entity_id.to_string());
        if !dir.is_dir() || dir.join(PARTIAL_MARKER).exists() {
            return FetchOutcome::NotYetAvailable;
        }

        let metadata_path = dir.join(METADATA_FILE);
        let metadata = match tokio::fs::read_to_string(&metadata_path).await {
            Ok(contents) => match serde_json::from_str::<OsMetadata>(&contents) {
                Ok(metadata) => metadata,
                Err(e) => return FetchOutcome::Failed(format!("invalid {}: {}", METADATA_FILE, e)),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => OsMetadata::default(),
            Err(e) => return FetchOutcome::Failed(format!("cannot read {}: {}", METADATA_FILE, e)),
        };

        let mut attachments = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => return FetchOutcome::Failed(e.to_string()),
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if path.is_file() && name != METADATA_FILE && !name.starts_with('.') {
                        attachments.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => return FetchOutcome::Failed(e.to_string()),
            }
        }
        attachments.sort();

        FetchOutcome::Fetched(FetchedOs {
            entity_id,
            metadata,
            attachments,
        })
    }
}
