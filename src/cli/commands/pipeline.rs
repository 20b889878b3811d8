//! Long-running stage command.

use std::sync::Arc;

use console::style;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Settings;
use crate::models::{Stage, TOMADOS_QUEUE};
use crate::repository::{migrations, DbContext};
use crate::scheduler::Scheduler;
use crate::services::{
    HttpFieldExtractor, InboxPortal, LocalObjectStore, MimeClassifier, QueueNotifier,
};
use crate::stages::{DownloadStage, StageRunner, TomadosStage, TriageStage};
use crate::work_queue::DbStageQueue;

/// Wire a stage with its production collaborators.
fn build_runner(
    settings: &Settings,
    ctx: &DbContext,
    stage: Stage,
) -> anyhow::Result<Arc<dyn StageRunner>> {
    let mut queue = DbStageQueue::new(
        ctx.status_store(stage),
        settings.retry_policy(stage),
        settings.claim_timeout(),
    );
    if stage.inbound_queue().is_some() {
        queue = queue.with_inbound(ctx.work_queue());
    }

    let runner: Arc<dyn StageRunner> = match stage {
        Stage::Download => Arc::new(DownloadStage::new(
            queue,
            Arc::new(InboxPortal::new(settings.inbox_dir.clone())),
            ctx.work_queue(),
            settings.download_settings(),
        )),
        Stage::Triage => Arc::new(TriageStage::new(
            queue,
            ctx.work_queue(),
            ctx.status_store(Stage::Download),
            Arc::new(MimeClassifier::new()),
            Arc::new(QueueNotifier::new(ctx.work_queue(), TOMADOS_QUEUE)),
            settings.triage_settings(),
        )),
        Stage::Tomados => Arc::new(TomadosStage::new(
            queue,
            ctx.work_queue(),
            ctx.status_store(Stage::Triage),
            Arc::new(HttpFieldExtractor::new(settings.extractor_config())?),
            Arc::new(LocalObjectStore::new(settings.bucket_dir.clone())),
            settings.tomados_settings(),
        )),
    };
    Ok(runner)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, stopping after the current cycle"),
        _ = terminate => info!("Received terminate signal, stopping after the current cycle"),
    }
}

/// Run one stage until interrupted, or for a single cycle with `once`.
pub async fn cmd_run(settings: &Settings, stage: Stage, once: bool) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    migrations::run_migrations(&settings.database_url()).await?;
    let ctx = settings.create_db_context()?;

    let runner = build_runner(settings, &ctx, stage)?;
    let scheduler = Scheduler::new(runner, ctx.service_status(), settings.poll_interval(stage));

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });

    if !once {
        println!(
            "{} Running {} every {}s (Ctrl+C to stop)",
            style("→").cyan(),
            style(stage).bold(),
            settings.poll_interval(stage).as_secs()
        );
    }

    let stats = scheduler.run(rx, once).await;
    println!(
        "{} {}: {} cycles, {} processed, {} done, {} failed",
        style("✓").green(),
        stage,
        stats.cycles,
        stats.session_processed,
        stats.session_done,
        stats.session_failed
    );
    Ok(())
}
