//! Tomados stage: extracts service-invoice fields for each triaged OS,
//! writes the `GERAL.txt` ledger plus one file per tomador, and uploads them.

pub mod ledger;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{CycleReport, StageError, StageRunner};
use crate::models::{EntityStatus, Failure, FailureReason, Stage, TOMADOS_QUEUE};
use crate::policy::FailureOutcome;
use crate::repository::{DieselWorkQueue, StatusStore};
use crate::services::{FieldExtractor, ObjectStore};
use crate::utils::{find_os_folder, unique_path};
use crate::work_queue::{DbStageQueue, WorkHandle, WorkQueue};

use ledger::{LedgerEntry, LEDGER_FILE, TOMADOS_FILE_PREFIX};

/// Folder triage fills with service invoices.
pub const TOMADOS_DIR: &str = "TOMADOS";

#[derive(Debug, Clone)]
pub struct TomadosSettings {
    pub work_dir: PathBuf,
    pub claim_batch: usize,
    /// Object key prefix for uploaded ledgers.
    pub results_prefix: String,
    /// Pause between extractor calls.
    pub delay: Duration,
}

pub struct TomadosStage {
    queue: DbStageQueue,
    inbound: DieselWorkQueue,
    triage: StatusStore,
    extractor: Arc<dyn FieldExtractor>,
    storage: Arc<dyn ObjectStore>,
    settings: TomadosSettings,
}

/// What one pass over a TOMADOS folder produced.
#[derive(Debug, Default)]
struct LedgerRun {
    rows: usize,
    errors: usize,
    renamed: usize,
    /// Per-tomador files written next to the ledger.
    tomador_files: Vec<String>,
}

impl TomadosStage {
    pub fn new(
        queue: DbStageQueue,
        inbound: DieselWorkQueue,
        triage: StatusStore,
        extractor: Arc<dyn FieldExtractor>,
        storage: Arc<dyn ObjectStore>,
        settings: TomadosSettings,
    ) -> Self {
        Self {
            queue,
            inbound,
            triage,
            extractor,
            storage,
            settings,
        }
    }

    /// Register triaged OS ids with invoices that never reached this stage.
    pub async fn reconcile(&self) -> Result<usize, StageError> {
        let mut accepted = 0;
        for id in self.triage.list_ids(&[EntityStatus::Done], None).await? {
            if self.queue.store().exists(id).await? {
                continue;
            }
            let Some(entity) = self.triage.get(id).await? else {
                continue;
            };
            if entity.payload.get("tomados") == Some(&Value::Bool(true))
                && self.queue.accept(id).await?
            {
                accepted += 1;
            }
        }
        if accepted > 0 {
            info!("Registered {} triaged OS ids for tomados", accepted);
        }
        Ok(accepted)
    }

    /// Turn queued notifications into pending rows.
    ///
    /// Notifications for ids this stage already knows are dropped, which
    /// makes duplicate deliveries harmless.
    async fn drain_notifications(&self, report: &mut CycleReport) -> Result<(), StageError> {
        while let Some(entity_id) = self.inbound.pull(TOMADOS_QUEUE).await? {
            if self.queue.accept(entity_id).await? {
                debug!(entity_id, "Notification accepted");
            } else {
                debug!(entity_id, "Notification for a known OS ignored");
                report.skipped += 1;
            }
        }
        Ok(())
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
                    format!("no folder for OS {}", entity_id),
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

        let pdfs = match invoice_pdfs(&folder.join(TOMADOS_DIR)) {
            Ok(pdfs) => pdfs,
            Err(e) => {
                let failure = Failure::transient(format!("cannot list {}: {}", TOMADOS_DIR, e));
                return self.record_failure(handle, failure, report).await;
            }
        };

        let mut result = Map::new();
        result.insert("folder".into(), Value::String(folder_name.clone()));
        if pdfs.is_empty() {
            info!(entity_id, folder = %folder_name, "No invoices to extract");
            result.insert("rows".into(), json!(0));
            self.queue.complete(handle, result).await?;
            report.done += 1;
            return Ok(());
        }

        let run = match self.write_ledger(&folder, &pdfs).await {
            Ok(run) => run,
            Err(e) => {
                let failure = Failure::transient(format!("cannot write {}: {}", LEDGER_FILE, e));
                return self.record_failure(handle, failure, report).await;
            }
        };
        if run.rows == 0 {
            let failure = Failure::transient(format!(
                "extraction failed for all {} invoices",
                run.errors
            ));
            return self.record_failure(handle, failure, report).await;
        }

        let url = match self.upload(&folder, &folder_name, LEDGER_FILE).await {
            Ok(url) => url,
            Err(failure) => return self.record_failure(handle, failure, report).await,
        };
        let mut tomador_urls = Vec::with_capacity(run.tomador_files.len());
        for file_name in &run.tomador_files {
            match self.upload(&folder, &folder_name, file_name).await {
                Ok(url) => tomador_urls.push(Value::String(url)),
                Err(failure) => return self.record_failure(handle, failure, report).await,
            }
        }

        result.insert("rows".into(), json!(run.rows));
        result.insert("extraction_errors".into(), json!(run.errors));
        result.insert("renamed".into(), json!(run.renamed));
        result.insert("ledger_url".into(), Value::String(url));
        result.insert("tomador_urls".into(), Value::Array(tomador_urls));
        self.queue.complete(handle, result).await?;
        info!(
            entity_id,
            folder = %folder_name,
            rows = run.rows,
            tomadores = run.tomador_files.len(),
            "Ledger uploaded"
        );
        report.done += 1;
        Ok(())
    }

    /// Upload one output file from the OS folder under the results prefix.
    async fn upload(
        &self,
        folder: &Path,
        folder_name: &str,
        file_name: &str,
    ) -> Result<String, Failure> {
        let key = format!(
            "{}/{}/{}",
            self.settings.results_prefix.trim_end_matches('/'),
            folder_name,
            file_name
        );
        self.storage
            .upload(&folder.join(file_name), &key)
            .await
            .map_err(|e| Failure::transient(format!("upload of {} failed: {}", file_name, e)))
    }

    /// Extract every invoice and rewrite the ledgers from scratch.
    ///
    /// Failed extractions are logged and left out; the ledgers are only
    /// replaced when at least one row was produced.
    async fn write_ledger(&self, folder: &Path, pdfs: &[PathBuf]) -> std::io::Result<LedgerRun> {
        let mut run = LedgerRun::default();
        let mut entries = Vec::with_capacity(pdfs.len());

        for (i, pdf) in pdfs.iter().enumerate() {
            if i > 0 && !self.settings.delay.is_zero() {
                tokio::time::sleep(self.settings.delay).await;
            }

            let fields = match self.extractor.extract_fields(pdf).await {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("Extraction failed for {}: {}", pdf.display(), e);
                    run.errors += 1;
                    continue;
                }
            };

            entries.push(LedgerEntry::from_fields(&fields));
            run.rows += 1;

            let name = pdf
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if ledger::is_renamed(&name) {
                continue;
            }
            let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
            if let (Some(new_name), Some(dir)) = (ledger::renamed_file_name(&fields, &suffix), pdf.parent()) {
                let target = unique_path(dir, &new_name);
                tokio::fs::rename(pdf, &target).await?;
                debug!("Renamed {} to {}", name, new_name);
                run.renamed += 1;
            }
        }

        if run.rows == 0 {
            return Ok(run);
        }

        let rows: String = entries.iter().map(|e| e.row() + "\n").collect();
        tokio::fs::write(folder.join(LEDGER_FILE), rows).await?;

        for stale in tomador_outputs(folder)? {
            tokio::fs::remove_file(&stale).await?;
        }
        for file in ledger::split_by_tomador(&entries) {
            tokio::fs::write(folder.join(&file.file_name), &file.contents).await?;
            debug!("Wrote {} with {} rows", file.file_name, file.rows);
            run.tomador_files.push(file.file_name);
        }
        Ok(run)
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
            FailureOutcome::Requeue => warn!(entity_id, %failure, "Tomados failed, will retry"),
            _ => warn!(entity_id, %failure, ?outcome, "Tomados failed for good"),
        }
        report.failed += 1;
        Ok(())
    }
}

/// Per-tomador files left in the OS folder by an earlier attempt.
fn tomador_outputs(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let prefix = format!("{} ", TOMADOS_FILE_PREFIX);
    let mut found = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        let is_output = path.file_name().is_some_and(|name| {
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".txt")
        });
        if is_output && path.is_file() {
            found.push(path);
        }
    }
    Ok(found)
}

fn invoice_pdfs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut pdfs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        {
            pdfs.push(path);
        }
    }
    pdfs.sort();
    Ok(pdfs)
}

#[async_trait]
impl StageRunner for TomadosStage {
    fn stage(&self) -> Stage {
        Stage::Tomados
    }

    async fn prepare(&self) -> Result<(), StageError> {
        self.reconcile().await.map(|_| ())
    }

    async fn run_cycle(&self) -> Result<CycleReport, StageError> {
        let mut report = CycleReport::default();

        self.queue.reap().await?;
        self.drain_notifications(&mut report).await?;

        let handles = self.queue.claim_batch(self.settings.claim_batch).await?;
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
        let queued = self.inbound.len(TOMADOS_QUEUE).await?;
        Ok(queued + self.queue.count_available().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetryPolicy;
    use crate::repository::{migrations, DbContext};
    use crate::services::{ExtractError, Fields, LocalObjectStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Fails for file names containing "ruim", returns fixed fields otherwise.
    struct FakeExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FieldExtractor for FakeExtractor {
        async fn extract_fields(&self, path: &Path) -> Result<Fields, ExtractError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let name = path.file_name().unwrap().to_string_lossy();
            if name.contains("ruim") {
                return Err(ExtractError::Api("HTTP 500".into()));
            }
            Ok([
                ("cnpj_prestador", "11.222.333/0001-44".to_string()),
                ("numero_nota", n.to_string()),
                ("razao_social", "FORNECEDOR".to_string()),
                ("uf", "SP".to_string()),
                ("valor_total", "100,00".to_string()),
                ("cnpj_tomador", "23.880.273/0001-73".to_string()),
                ("razao_social_tomador", "PADARIA".to_string()),
                ("uf_tomador", "PR".to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect())
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        ctx: DbContext,
        extractor: Arc<FakeExtractor>,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let db = root.join("osflow.db");
        migrations::run_migrations(&db.display().to_string())
            .await
            .unwrap();
        std::fs::create_dir_all(root.join("work")).unwrap();
        let ctx = DbContext::from_sqlite_path(&db).unwrap();
        Fixture {
            _dir: dir,
            root,
            ctx,
            extractor: Arc::new(FakeExtractor {
                calls: AtomicUsize::new(0),
            }),
        }
    }

    fn stage(fx: &Fixture) -> TomadosStage {
        let queue = DbStageQueue::new(
            fx.ctx.status_store(Stage::Tomados),
            RetryPolicy::default(),
            chrono::Duration::minutes(90),
        )
        .with_inbound(fx.ctx.work_queue());
        TomadosStage::new(
            queue,
            fx.ctx.work_queue(),
            fx.ctx.status_store(Stage::Triage),
            fx.extractor.clone(),
            Arc::new(LocalObjectStore::new(fx.root.join("bucket"))),
            TomadosSettings {
                work_dir: fx.root.join("work"),
                claim_batch: 20,
                results_prefix: "tomados_saida".into(),
                delay: Duration::ZERO,
            },
        )
    }

    fn invoices(fx: &Fixture, folder: &str, names: &[&str]) -> PathBuf {
        let dir = fx.root.join("work").join(folder).join(TOMADOS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        for name in names {
            std::fs::write(dir.join(name), b"%PDF-1.4").unwrap();
        }
        dir.parent().unwrap().to_path_buf()
    }

    #[tokio::test]
    async fn test_ledger_written_renamed_and_uploaded() {
        let fx = fixture().await;
        let folder = invoices(&fx, "5-PADARIA", &["a.pdf", "b.pdf", "ruim.pdf"]);
        fx.ctx.work_queue().publish(TOMADOS_QUEUE, 5).await.unwrap();

        let report = stage(&fx).run_cycle().await.unwrap();
        assert_eq!(report.done, 1);

        let ledger = std::fs::read_to_string(folder.join(LEDGER_FILE)).unwrap();
        assert_eq!(ledger.lines().count(), 2);
        assert!(ledger.lines().all(|l| l.split(';').count() == 28));

        let uploaded = fx.root.join("bucket/tomados_saida/5-PADARIA/GERAL.txt");
        assert_eq!(std::fs::read_to_string(uploaded).unwrap(), ledger);

        let names: Vec<String> = std::fs::read_dir(folder.join(TOMADOS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"ruim.pdf".to_string()));
        assert_eq!(names.iter().filter(|n| ledger::is_renamed(n)).count(), 2);

        let entity = fx
            .ctx
            .status_store(Stage::Tomados)
            .get(5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.status, EntityStatus::Done);
        assert_eq!(entity.payload.get("rows"), Some(&json!(2)));
        assert_eq!(entity.payload.get("extraction_errors"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_duplicate_notification_for_done_entity_is_ignored() {
        let fx = fixture().await;
        invoices(&fx, "8-MERCADO", &["a.pdf"]);
        let wq = fx.ctx.work_queue();
        wq.publish(TOMADOS_QUEUE, 8).await.unwrap();

        let tomados = stage(&fx);
        tomados.run_cycle().await.unwrap();
        let calls = fx.extractor.calls.load(Ordering::SeqCst);

        wq.publish(TOMADOS_QUEUE, 8).await.unwrap();
        let report = tomados.run_cycle().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(fx.extractor.calls.load(Ordering::SeqCst), calls);
        assert!(wq.is_empty(TOMADOS_QUEUE).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_extractions_failing_requeues() {
        let fx = fixture().await;
        invoices(&fx, "9-X", &["ruim.pdf"]);
        fx.ctx.work_queue().publish(TOMADOS_QUEUE, 9).await.unwrap();

        let report = stage(&fx).run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);

        let entity = fx
            .ctx
            .status_store(Stage::Tomados)
            .get(9)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.status, EntityStatus::Pending);
        assert_eq!(entity.attempts, 1);
    }

    #[tokio::test]
    async fn test_reconcile_picks_up_triaged_invoices() {
        let fx = fixture().await;
        let triage = fx.ctx.status_store(Stage::Triage);
        let mut with = Map::new();
        with.insert("tomados".into(), Value::Bool(true));
        let mut without = Map::new();
        without.insert("tomados".into(), Value::Bool(false));
        triage.mark(1, EntityStatus::Done, false, &with).await.unwrap();
        triage.mark(2, EntityStatus::Done, false, &without).await.unwrap();

        let tomados = stage(&fx);
        assert_eq!(tomados.reconcile().await.unwrap(), 1);
        assert_eq!(tomados.reconcile().await.unwrap(), 0);
        assert!(fx.ctx.status_store(Stage::Tomados).exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_tomador_files_replace_earlier_output() {
        let fx = fixture().await;
        let folder = invoices(&fx, "6-PADARIA", &["a.pdf", "b.pdf"]);
        std::fs::write(folder.join("TOMADOS ANTIGO - 1.txt"), "old").unwrap();
        fx.ctx.work_queue().publish(TOMADOS_QUEUE, 6).await.unwrap();

        let report = stage(&fx).run_cycle().await.unwrap();
        assert_eq!(report.done, 1);

        assert!(!folder.join("TOMADOS ANTIGO - 1.txt").exists());
        let name = "TOMADOS PADARIA - 23880273000173.txt";
        let contents = std::fs::read_to_string(folder.join(name)).unwrap();
        let rows: Vec<&str> = contents.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.split(';').nth(10) == Some("2933")));

        let uploaded = fx.root.join("bucket/tomados_saida/6-PADARIA").join(name);
        assert_eq!(std::fs::read_to_string(uploaded).unwrap(), contents);

        let entity = fx
            .ctx
            .status_store(Stage::Tomados)
            .get(6)
            .await
            .unwrap()
            .unwrap();
        let urls = entity.payload["tomador_urls"].as_array().unwrap();
        assert_eq!(urls.len(), 1);
    }
}
