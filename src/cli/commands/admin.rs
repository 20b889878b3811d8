//! Operator commands that repair queue and status state.

use console::style;

use crate::config::Settings;
use crate::models::{Stage, TOMADOS_QUEUE, TRIAGE_QUEUE};
use crate::policy::GapHealer;
use crate::repository::DbContext;
use crate::work_queue::DbStageQueue;

fn stage_queue(settings: &Settings, ctx: &DbContext, stage: Stage) -> DbStageQueue {
    let queue = DbStageQueue::new(
        ctx.status_store(stage),
        settings.retry_policy(stage),
        settings.claim_timeout(),
    );
    if stage.inbound_queue().is_some() {
        queue.with_inbound(ctx.work_queue())
    } else {
        queue
    }
}

/// Reset failed entities to pending.
pub async fn cmd_reseed(settings: &Settings, stage: Stage, ids: &[i64]) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let queue = stage_queue(settings, &ctx, stage);

    let mut reset = 0;
    for id in ids {
        match queue.reseed(*id).await {
            Ok(()) => {
                reset += 1;
                println!("  {} {} {}", style("✓").green(), stage, id);
            }
            Err(e) => println!("  {} {} {}: {}", style("✗").red(), stage, id, e),
        }
    }
    println!("{} Reseeded {}/{}", style("✓").green(), reset, ids.len());
    Ok(())
}

/// Return stale claims to pending.
pub async fn cmd_reap(settings: &Settings, stage: Stage) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let reaped = stage_queue(settings, &ctx, stage).reap().await?;
    if reaped.is_empty() {
        println!("{} No stale claims in {}", style("✓").green(), stage);
    } else {
        println!(
            "{} Reclaimed {} entities in {}: {:?}",
            style("✓").green(),
            reaped.len(),
            stage,
            reaped
        );
    }
    Ok(())
}

/// Fill gaps in the known download id range.
pub async fn cmd_heal(settings: &Settings) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let healed = GapHealer::new(ctx.status_store(Stage::Download))
        .heal()
        .await?;
    if healed.is_empty() {
        println!("{} No gaps found", style("✓").green());
    } else {
        println!(
            "{} Inserted {} missing ids: {:?}",
            style("✓").green(),
            healed.len(),
            healed
        );
    }
    Ok(())
}

/// Publish ids to a named queue.
pub async fn cmd_enqueue(settings: &Settings, queue: &str, ids: &[i64]) -> anyhow::Result<()> {
    if queue != TRIAGE_QUEUE && queue != TOMADOS_QUEUE {
        anyhow::bail!(
            "unknown queue '{}' (expected {} or {})",
            queue,
            TRIAGE_QUEUE,
            TOMADOS_QUEUE
        );
    }
    let ctx = settings.create_db_context()?;
    let work_queue = ctx.work_queue();
    for id in ids {
        work_queue.publish(queue, *id).await?;
    }
    println!(
        "{} Published {} ids to {} (length {})",
        style("✓").green(),
        ids.len(),
        queue,
        work_queue.len(queue).await?
    );
    Ok(())
}
