//! Pipeline status report.

use console::style;

use crate::config::Settings;
use crate::models::{EntityStatus, ServiceState, Stage};

/// Heartbeats older than this are reported as stale.
const STALE_AFTER_SECS: i64 = 600;
/// Queue items listed per queue.
const QUEUE_PREVIEW: i64 = 5;
/// Stopped services are forgotten after a week.
const STOPPED_RETENTION_SECS: i64 = 7 * 24 * 3600;

pub async fn cmd_status(settings: &Settings, only: Option<Stage>) -> anyhow::Result<()> {
    if !settings.database_exists() {
        println!(
            "{} No database at {} (run `osflow init`)",
            style("!").yellow(),
            settings.database_path().display()
        );
        return Ok(());
    }
    let ctx = settings.create_db_context()?;
    let queues = ctx.work_queue();

    let stages: Vec<Stage> = match only {
        Some(stage) => vec![stage],
        None => Stage::ALL.to_vec(),
    };

    println!("{}", style("Entities").bold());
    for stage in &stages {
        let counts = ctx.status_store(*stage).counts().await?;
        let count_of = |status: EntityStatus| {
            counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };
        let mut line = format!("  {:<10}", stage.as_str());
        for status in EntityStatus::ALL {
            line.push_str(&format!(" {}={:<6}", status.as_str(), count_of(status)));
        }
        println!("{}", line);

        if let Some(queue) = stage.inbound_queue() {
            let len = queues.len(queue).await?;
            if len == 0 {
                println!("  {:<10} queue {} is empty", "", queue);
            } else {
                let head: Vec<String> = queues
                    .peek(queue, QUEUE_PREVIEW)
                    .await?
                    .into_iter()
                    .map(|item| item.entity_id.to_string())
                    .collect();
                println!(
                    "  {:<10} queue {} holds {} (next: {})",
                    "",
                    queue,
                    len,
                    head.join(", ")
                );
            }
        }
    }

    let heartbeats = ctx.service_status();
    let pruned = heartbeats.cleanup_stale(STOPPED_RETENTION_SECS).await?;
    if pruned > 0 {
        tracing::debug!("Pruned {} stopped service rows", pruned);
    }
    let services = heartbeats.get_all().await?;
    let services: Vec<_> = services
        .into_iter()
        .filter(|s| stages.contains(&s.stage))
        .collect();
    if services.is_empty() {
        return Ok(());
    }

    println!();
    println!("{}", style("Services").bold());
    for service in services {
        let state = if service.status != ServiceState::Stopped && service.is_stale(STALE_AFTER_SECS)
        {
            style("stale".to_string()).red()
        } else {
            match service.status {
                ServiceState::Error => style(service.status.as_str().to_string()).red(),
                ServiceState::Running => style(service.status.as_str().to_string()).green(),
                _ => style(service.status.as_str().to_string()).dim(),
            }
        };
        println!(
            "  {:<24} {:<10} heartbeat {}",
            service.id,
            state,
            service.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(task) = service.current_task {
            println!("  {:<24} task: {}", "", task);
        }
        if let Some(err) = service.last_error {
            println!(
                "  {:<24} {} errors, last: {}",
                "",
                service.error_count,
                style(err).red()
            );
        }
    }

    Ok(())
}
