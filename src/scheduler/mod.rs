//! Fixed-interval driver for one stage.
//!
//! Every tick runs one cycle and writes a heartbeat row. A cycle that did
//! work is followed immediately by the next one; an idle cycle sleeps for
//! the interval. Shutdown is observed at the sleep boundary, so a cycle in
//! progress always finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::{CycleStats, ServiceStatus};
use crate::repository::DieselServiceStatusRepository;
use crate::stages::{CycleReport, StageRunner};

pub struct Scheduler {
    runner: Arc<dyn StageRunner>,
    heartbeats: DieselServiceStatusRepository,
    interval: Duration,
    status: ServiceStatus,
    stats: CycleStats,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn StageRunner>,
        heartbeats: DieselServiceStatusRepository,
        interval: Duration,
    ) -> Self {
        let status = ServiceStatus::new(runner.stage());
        Self {
            runner,
            heartbeats,
            interval,
            status,
            stats: CycleStats::default(),
        }
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    async fn beat(&self) {
        if let Err(e) = self.heartbeats.upsert(&self.status).await {
            warn!("Failed to update service heartbeat: {}", e);
        }
    }

    /// Run the stage's startup step. Failures are recorded, not fatal.
    pub async fn prepare(&mut self) {
        self.status.set_running(Some("preparing"));
        self.beat().await;
        if let Err(e) = self.runner.prepare().await {
            error!(stage = %self.runner.stage(), "Startup step failed: {}", e);
            self.status.record_error(&e.to_string());
            self.beat().await;
        }
    }

    /// Run one cycle and report it. Returns `None` when the cycle failed.
    pub async fn tick(&mut self) -> Option<CycleReport> {
        let stage = self.runner.stage();
        self.stats.cycles += 1;

        let result = self.runner.run_cycle().await;
        let report = match result {
            Ok(report) => {
                self.stats.session_processed += report.processed;
                self.stats.session_done += report.done;
                self.stats.session_failed += report.failed;
                if report.had_work() {
                    info!(
                        %stage,
                        processed = report.processed,
                        done = report.done,
                        failed = report.failed,
                        deferred = report.deferred,
                        skipped = report.skipped,
                        "Cycle finished"
                    );
                    self.status
                        .set_running(Some(&format!("processed {} entities", report.processed)));
                } else {
                    debug!(%stage, "Nothing to do");
                    self.status.set_idle();
                }
                Some(report)
            }
            Err(e) => {
                error!(%stage, "Cycle failed: {}", e);
                self.status.record_error(&e.to_string());
                None
            }
        };

        self.stats.queue_size = match self.runner.backlog().await {
            Ok(size) => Some(size),
            Err(e) => {
                debug!(%stage, "Backlog unavailable: {}", e);
                None
            }
        };
        self.status.update_stats(&self.stats);
        self.beat().await;
        report
    }

    /// Tick until `shutdown` turns true, or once when `once` is set.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, once: bool) -> CycleStats {
        let stage = self.runner.stage();
        info!(%stage, interval_secs = self.interval.as_secs(), "Stage started");
        self.prepare().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.tick().await;
            if once {
                break;
            }
            if report.is_some_and(|r| r.had_work()) {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender dropped; keep the normal cadence.
                        tokio::time::sleep(self.interval).await;
                    }
                }
            }
        }

        self.status.set_stopped();
        self.beat().await;
        info!(%stage, cycles = self.stats.cycles, "Stage stopped");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ServiceState, Stage};
    use crate::repository::{migrations, DbContext};
    use crate::stages::StageError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    /// Fails on the second cycle, has work on the first, idles afterwards.
    struct ScriptedRunner {
        cycles: AtomicU64,
    }

    #[async_trait]
    impl StageRunner for ScriptedRunner {
        fn stage(&self) -> Stage {
            Stage::Triage
        }

        async fn run_cycle(&self) -> Result<CycleReport, StageError> {
            match self.cycles.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(CycleReport {
                    processed: 2,
                    done: 2,
                    ..Default::default()
                }),
                1 => Err(StageError::Collaborator("portal exploded".into())),
                _ => Ok(CycleReport::default()),
            }
        }

        async fn backlog(&self) -> Result<u64, StageError> {
            Ok(0)
        }
    }

    async fn context() -> (tempfile::TempDir, DbContext) {
        let dir = tempdir().unwrap();
        let db = dir.path().join("osflow.db");
        migrations::run_migrations(&db.display().to_string())
            .await
            .unwrap();
        let ctx = DbContext::from_sqlite_path(&db).unwrap();
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_errors_are_recorded_and_loop_continues() {
        let (_dir, ctx) = context().await;
        let runner = Arc::new(ScriptedRunner {
            cycles: AtomicU64::new(0),
        });
        let mut scheduler = Scheduler::new(
            runner.clone(),
            ctx.service_status(),
            Duration::from_millis(10),
        );

        assert!(scheduler.tick().await.is_some());
        assert!(scheduler.tick().await.is_none());
        assert_eq!(scheduler.status().status, ServiceState::Error);
        assert!(scheduler.tick().await.is_some());
        assert_eq!(scheduler.status().status, ServiceState::Idle);

        let row = ctx
            .service_status()
            .get(&scheduler.status().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.error_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("portal exploded"));
        assert_eq!(scheduler.stats().session_done, 2);
        assert_eq!(scheduler.stats().cycles, 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_at_sleep_boundary() {
        let (_dir, ctx) = context().await;
        let runner = Arc::new(ScriptedRunner {
            cycles: AtomicU64::new(0),
        });
        let scheduler = Scheduler::new(runner.clone(), ctx.service_status(), Duration::from_secs(3600));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(rx, false));
        // Let it reach the idle sleep after the failing cycle.
        while runner.cycles.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.cycles, 2);

        let rows = ctx.service_status().get_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_once_runs_a_single_cycle() {
        let (_dir, ctx) = context().await;
        let runner = Arc::new(ScriptedRunner {
            cycles: AtomicU64::new(0),
        });
        let (_tx, rx) = watch::channel(false);
        let stats = Scheduler::new(runner, ctx.service_status(), Duration::from_secs(3600))
            .run(rx, true)
            .await;
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.session_processed, 2);
    }
}
