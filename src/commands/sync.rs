// ABOUTME: Sync commands - one run, a single page, or the polling daemon
// ABOUTME: Page failures are reported but do not fail the command

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tokio::sync::watch as watch_channel;

use crate::config::SyncConfig;
use crate::survey::daemon::SurveyDaemon;
use crate::survey::orchestrator::{self, RunSummary};
use crate::survey::scheduler::PageState;

/// Run one sync cycle over every survey that needs updating.
pub async fn run(config: SyncConfig) -> Result<()> {
    tracing::info!("Starting survey sync run");
    let backend = orchestrator::connect_backend(&config).await?;

    let (stop_tx, stop_rx) = watch_channel::channel(false);
    let stop_on_ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received; finishing the current page");
            let _ = stop_tx.send(true);
        }
    });

    let summary =
        orchestrator::execute_with(&backend, &config, orchestrator::now(), Some(stop_rx)).await;
    stop_on_ctrl_c.abort();

    print_summary(&summary?);
    Ok(())
}

/// Catch up a single survey page, ignoring the refresh interval.
pub async fn sync_page(config: SyncConfig, page_id: i64, since: Option<NaiveDateTime>) -> Result<()> {
    let backend = orchestrator::connect_backend(&config).await?;
    let outcome =
        orchestrator::execute_page(&backend, &config, page_id, since, orchestrator::now()).await?;

    match outcome.state {
        PageState::Failed => {
            println!(
                "✗ Page {} failed: {}",
                page_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        _ => {
            println!(
                "✓ Page {}: {} row(s) written in {} batch(es); last refresh {}",
                page_id,
                outcome.rows_written,
                outcome.batches,
                outcome
                    .checkpoint_after
                    .map(|ts| ts.to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            if outcome.more_pending {
                println!("  More actions remain; run again to continue.");
            }
        }
    }
    Ok(())
}

/// Run sync cycles every poll interval until Ctrl+C.
pub async fn watch(config: SyncConfig) -> Result<()> {
    config.validate()?;
    let (shutdown_tx, shutdown_rx) = watch_channel::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received; stopping after the current page");
            let _ = shutdown_tx.send(true);
        }
    });

    let daemon = SurveyDaemon::new(config);
    let stats = daemon
        .run(shutdown_rx)
        .await
        .context("Survey sync daemon stopped with an error")?;

    println!(
        "Stopped after {} cycle(s) ({} failed), {} row(s) written",
        stats.cycles, stats.failed_cycles, stats.total_rows
    );
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Survey Sync Summary");
    println!("{}", "═".repeat(61));
    println!("  Pages synced:  {}", summary.pages_succeeded);
    println!("  Pages failed:  {}", summary.pages_failed);
    println!("  Pages skipped: {}", summary.pages_skipped);
    println!("  Rows written:  {}", summary.total_rows);
    println!("  Duration:      {}ms", summary.duration_ms);
    if !summary.failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in &summary.failures {
            println!("  ✗ page {}: {}", failure.page_id, failure.error);
        }
    }
    println!("{}", "═".repeat(61));
}
