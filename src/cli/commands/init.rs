//! Initialize command.

use console::style;

use crate::config::Settings;
use crate::repository::migrations;

/// Initialize the data directories and database.
pub async fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    migrations::run_migrations(&settings.database_url()).await?;

    let applied = migrations::applied_migrations(&settings.database_url()).await?;
    for name in &applied {
        println!("  {} {}", style("✓").green(), name);
    }

    println!(
        "{} Initialized osflow in {}",
        style("✓").green(),
        settings.data_dir.display()
    );
    println!("  {:<10} {}", "inbox", settings.inbox_dir.display());
    println!("  {:<10} {}", "downloads", settings.downloads_dir.display());
    println!("  {:<10} {}", "work", settings.work_dir.display());
    println!("  {:<10} {}", "bucket", settings.bucket_dir.display());

    Ok(())
}
