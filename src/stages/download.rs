//! Download stage: seeds new OS ids, fetches their attachments from the
//! portal and hands finished folders to triage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{CycleReport, StageError, StageRunner};
use crate::models::{Failure, FailureReason, Stage, TRIAGE_QUEUE};
use crate::policy::{FailureOutcome, GapHealer, SeedConfig, Seeder};
use crate::repository::DieselWorkQueue;
use crate::services::{FetchOutcome, FetchedOs, Portal};
use crate::utils::{os_folder_name, unique_path};
use crate::work_queue::{DbStageQueue, WorkHandle, WorkQueue};

/// File written into every OS folder with the client's message.
pub const MESSAGE_FILE: &str = "!!!ABRA_MENSAGEM_DO_CLIENTE!!!.txt";

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Pristine copy of every downloaded OS.
    pub downloads_dir: PathBuf,
    /// Working copy that triage reorganizes.
    pub work_dir: PathBuf,
    pub max_attachments: usize,
    pub claim_batch: usize,
    pub seed: SeedConfig,
}

pub struct DownloadStage {
    queue: DbStageQueue,
    portal: Arc<dyn Portal>,
    triage: DieselWorkQueue,
    settings: DownloadSettings,
}

impl DownloadStage {
    pub fn new(
        queue: DbStageQueue,
        portal: Arc<dyn Portal>,
        triage: DieselWorkQueue,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            queue,
            portal,
            triage,
            settings,
        }
    }

    /// Insert newly visible ids and fill gaps in the known range.
    async fn discover(&self) -> Result<(), StageError> {
        let store = self.queue.store().clone();

        let healed = GapHealer::new(store.clone()).heal().await?;
        if !healed.is_empty() {
            info!("Healed {} missing OS ids", healed.len());
        }

        match self.portal.latest_id().await {
            Ok(latest) => {
                let seeded = Seeder::new(store, self.settings.seed)
                    .seed(latest)
                    .await?;
                if !seeded.is_empty() {
                    info!("Seeded {} new OS ids up to {}", seeded.len(), latest);
                }
            }
            Err(e) => warn!("Skipping seeding this cycle: {}", e),
        }
        Ok(())
    }

    async fn process(&self, handle: WorkHandle, report: &mut CycleReport) -> Result<(), StageError> {
        let entity_id = handle.entity_id();
        report.processed += 1;

        let fetched = match self.portal.fetch(entity_id).await {
            FetchOutcome::Fetched(fetched) => fetched,
            FetchOutcome::NotYetAvailable => {
                debug!(entity_id, "OS not available yet");
                self.queue.defer(handle).await?;
                report.deferred += 1;
                return Ok(());
            }
            FetchOutcome::Failed(detail) => {
                return self.record_failure(handle, Failure::transient(detail), report).await;
            }
        };

        if fetched.attachments.len() > self.settings.max_attachments {
            let failure = Failure::permanent(
                FailureReason::AttachmentLimit,
                format!(
                    "{} attachments, limit is {}",
                    fetched.attachments.len(),
                    self.settings.max_attachments
                ),
            );
            return self.record_failure(handle, failure, report).await;
        }

        let downloads_dir = self.settings.downloads_dir.clone();
        let work_dir = self.settings.work_dir.clone();
        let staged = fetched.clone();
        let materialized = tokio::task::spawn_blocking(move || {
            materialize(&staged, &downloads_dir, &work_dir)
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
        .and_then(|r| r);

        let folder = match materialized {
            Ok(folder) => folder,
            Err(e) => {
                let failure = Failure::transient(format!("cannot store attachments: {}", e));
                return self.record_failure(handle, failure, report).await;
            }
        };

        let mut result = Map::new();
        result.insert("folder".into(), Value::String(folder.clone()));
        result.insert("nickname".into(), json!(fetched.metadata.nickname));
        result.insert("subject".into(), json!(fetched.metadata.subject));
        result.insert("description".into(), json!(fetched.metadata.description));
        result.insert("attachments_total".into(), json!(fetched.attachments.len()));

        self.queue.complete(handle, result).await?;
        self.triage.publish(TRIAGE_QUEUE, entity_id).await?;
        info!(entity_id, %folder, "Downloaded {} attachments", fetched.attachments.len());
        report.done += 1;
        Ok(())
    }

    async fn record_failure(
        &self,
        handle: WorkHandle,
        failure: Failure,
        report: &mut CycleReport,
    ) -> Result<(), StageError> {
        let entity_id = handle.entity_id();
        let outcome = self.queue.fail(handle, &failure).await?;
        match outcome {
            FailureOutcome::Exhausted | FailureOutcome::Rejected => {
                warn!(entity_id, %failure, ?outcome, "Download failed for good")
            }
            _ => debug!(entity_id, %failure, ?outcome, "Download failed"),
        }
        report.failed += 1;
        Ok(())
    }
}

/// Copy the attachments into a fresh OS folder in `downloads_dir`, write the
/// client message and mirror the folder into `work_dir`.
///
/// Returns the folder name.
fn materialize(os: &FetchedOs, downloads_dir: &Path, work_dir: &Path) -> std::io::Result<String> {
    let folder = os_folder_name(os.entity_id, &os.metadata.nickname);
    let target = downloads_dir.join(&folder);
    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    std::fs::create_dir_all(&target)?;

    for attachment in &os.attachments {
        let name = attachment
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "anexo".to_string());
        std::fs::copy(attachment, unique_path(&target, &name))?;
    }

    std::fs::write(
        target.join(MESSAGE_FILE),
        format!(
            "Assunto: {}\nDetalhe: {}",
            os.metadata.subject, os.metadata.description
        ),
    )?;

    let mirror = work_dir.join(&folder);
    if mirror.exists() {
        std::fs::remove_dir_all(&mirror)?;
    }
    copy_dir(&target, &mirror)?;

    Ok(folder)
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

#[async_trait]
impl StageRunner for DownloadStage {
    fn stage(&self) -> Stage {
        Stage::Download
    }

    async fn run_cycle(&self) -> Result<CycleReport, StageError> {
        let mut report = CycleReport::default();

        self.queue.reap().await?;
        self.discover().await?;

        let handles = self.queue.claim_batch(self.settings.claim_batch).await?;
        if !handles.is_empty() {
            debug!("Claimed {} OS ids for download", handles.len());
        }
        for handle in handles {
            let entity_id = handle.entity_id();
            if let Err(e) = self.process(handle, &mut report).await {
                if !e.is_lost_claim() {
                    return Err(e);
                }
                warn!(entity_id, "Claim lost before the outcome was recorded: {}", e);
            }
        }
        Ok(report)
    }

    async fn backlog(&self) -> Result<u64, StageError> {
        Ok(self.queue.count_available().await?)
    }
}
