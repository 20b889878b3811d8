//! Triage stage: unpacks and sorts the files of each downloaded OS, then
//! notifies the tomados stage when service invoices were found.

pub mod archive;
pub mod routing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{CycleReport, StageError, StageRunner};
use crate::models::{EntityStatus, Failure, FailureReason, Stage, TRIAGE_QUEUE};
use crate::policy::FailureOutcome;
use crate::repository::{DieselWorkQueue, StatusStore};
use crate::services::{Classifier, Notifier};
use crate::utils::find_os_folder;
use crate::work_queue::{DbStageQueue, WorkHandle, WorkQueue, WorkQueueError};

use routing::{RoutingSettings, DONE_MARKER};

#[derive(Debug, Clone)]
pub struct TriageSettings {
    pub work_dir: PathBuf,
    /// Items pulled from the queue per cycle.
    pub claim_batch: usize,
    pub max_files: usize,
    pub routing: RoutingSettings,
}

pub struct TriageStage {
    queue: DbStageQueue,
    inbound: DieselWorkQueue,
    downloads: StatusStore,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn Notifier>,
    settings: TriageSettings,
}

impl TriageStage {
    pub fn new(
        queue: DbStageQueue,
        inbound: DieselWorkQueue,
        downloads: StatusStore,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
        settings: TriageSettings,
    ) -> Self {
        Self {
            queue,
            inbound,
            downloads,
            classifier,
            notifier,
            settings,
        }
    }

    /// Requeue every downloaded OS that triage has not started yet.
    ///
    /// Covers publications lost between a download finishing and the queue
    /// insert.
    pub async fn reconcile(&self) -> Result<usize, StageError> {
        let downloaded = self
            .downloads
            .list_ids(&[EntityStatus::Done], None)
            .await?;
        let started: std::collections::HashSet<i64> = self
            .queue
            .store()
            .list_ids(
                &[
                    EntityStatus::Awaiting,
                    EntityStatus::InProgress,
                    EntityStatus::Done,
                    EntityStatus::Failed,
                ],
                None,
            )
            .await?
            .into_iter()
            .collect();

        let mut requeued = 0;
        for id in downloaded.into_iter().filter(|id| !started.contains(id)) {
            if self.inbound.requeue(TRIAGE_QUEUE, id).await? {
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!("Requeued {} downloaded OS ids for triage", requeued);
        }
        Ok(requeued)
    }

    async fn process(&self, handle: WorkHandle, report: &mut CycleReport) -> Result<(), StageError> {
        let entity_id = handle.entity_id();
        report.processed += 1;

        let work_dir = self.settings.work_dir.clone();
        let folder = match tokio::task::spawn_blocking(move || find_os_folder(&work_dir, entity_id))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|r| r)
        {
            Ok(Some(folder)) => folder,
            Ok(None) => {
                let failure = Failure::permanent(
                    FailureReason::MissingSource,
                    format!("no folder for OS {} in {}", entity_id, self.settings.work_dir.display()),
                );
                return self.record_failure(handle, failure, report).await;
            }
            Err(e) => {
                let failure = Failure::transient(format!("cannot scan work dir: {}", e));
                return self.record_failure(handle, failure, report).await;
            }
        };
        let folder_name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if folder.join(DONE_MARKER).exists() {
            info!(entity_id, folder = %folder_name, "Already triaged, recording result");
            let mut result = folder_result(&folder, &folder_name);
            result.insert("already_processed".into(), Value::Bool(true));
            return self.finish(handle, &folder, result, report).await;
        }

        match self.triage_folder(&folder).await {
            Ok(Triaged::Done(summary)) => {
                let mut result = folder_result(&folder, &folder_name);
                result.insert("files_total".into(), json!(summary.total));
                result.insert("routed".into(), json!(summary.routed));
                self.finish(handle, &folder, result, report).await
            }
            Ok(Triaged::TooManyFiles(count)) => {
                let failure = Failure::permanent(
                    FailureReason::FileLimit,
                    format!("{} files, limit is {}", count, self.settings.max_files),
                );
                self.record_failure(handle, failure, report).await
            }
            Err(e) => self.record_failure(handle, Failure::transient(e), report).await,
        }
    }

    /// Unpack, check the file limit, route and mark the folder done.
    async fn triage_folder(&self, folder: &Path) -> Result<Triaged, String> {
        let root = folder.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || {
            archive::extract_all(&root)
                .map_err(|e| e.to_string())
                .and_then(|summary| {
                    routing::pending_files(&root)
                        .map(|files| (summary, files.len()))
                        .map_err(|e| e.to_string())
                })
        })
        .await
        .map_err(|e| e.to_string())?;
        let (extraction, file_count) = extracted?;

        if !extraction.failed_members.is_empty() || !extraction.broken_archives.is_empty() {
            warn!(
                folder = %folder.display(),
                failed_members = extraction.failed_members.len(),
                broken_archives = extraction.broken_archives.len(),
                "Some archive content could not be extracted"
            );
        }
        if file_count > self.settings.max_files {
            return Ok(Triaged::TooManyFiles(file_count));
        }

        let summary = routing::route_folder(folder, self.classifier.as_ref(), &self.settings.routing)
            .await
            .map_err(|e| format!("routing failed: {}", e))?;

        std::fs::write(
            folder.join(DONE_MARKER),
            format!(
                "Processamento concluído em: {}\nTotal de arquivos detectados: {}\n",
                Utc::now().to_rfc3339(),
                summary.total
            ),
        )
        .map_err(|e| format!("cannot write {}: {}", DONE_MARKER, e))?;

        Ok(Triaged::Done(summary))
    }

    async fn finish(
        &self,
        handle: WorkHandle,
        folder: &Path,
        result: Map<String, Value>,
        report: &mut CycleReport,
    ) -> Result<(), StageError> {
        let entity_id = handle.entity_id();
        let notify = routing::has_tomados_documents(folder);
        self.queue.complete(handle, result.clone()).await?;
        report.done += 1;

        if notify {
            self.notifier.notify(entity_id, &result).await?;
            info!(entity_id, "Triaged, tomados notified");
        } else {
            info!(entity_id, "Triaged");
        }
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
            FailureOutcome::Requeue => warn!(entity_id, %failure, "Triage failed, requeued"),
            _ => warn!(entity_id, %failure, ?outcome, "Triage failed for good"),
        }
        report.failed += 1;
        Ok(())
    }
}

enum Triaged {
    Done(routing::RoutingSummary),
    TooManyFiles(usize),
}

fn folder_result(folder: &Path, folder_name: &str) -> Map<String, Value> {
    let mut result = Map::new();
    result.insert("folder".into(), Value::String(folder_name.to_string()));
    result.insert("tomados".into(), Value::Bool(folder.join("TOMADOS").is_dir()));
    result.insert("extrato".into(), Value::Bool(folder.join("EXTRATO").is_dir()));
    result
}

#[async_trait]
impl StageRunner for TriageStage {
    fn stage(&self) -> Stage {
        Stage::Triage
    }

    async fn prepare(&self) -> Result<(), StageError> {
        self.reconcile().await.map(|_| ())
    }

    async fn run_cycle(&self) -> Result<CycleReport, StageError> {
        let mut report = CycleReport::default();
        self.queue.reap().await?;

        for _ in 0..self.settings.claim_batch {
            let Some(entity_id) = self.inbound.pull(TRIAGE_QUEUE).await? else {
                break;
            };

            self.queue.accept(entity_id).await?;
            let handle = match self.queue.claim(entity_id).await {
                Ok(handle) => handle,
                Err(WorkQueueError::NotClaimable { status, .. }) => {
                    debug!(entity_id, %status, "Duplicate delivery ignored");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

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
        Ok(self.inbound.len(TRIAGE_QUEUE).await?)
    }
}
