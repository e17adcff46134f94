// ABOUTME: Polling daemon - runs a sync cycle every poll interval until shutdown
// ABOUTME: Shutdown is honored between pages; the page in flight always finishes

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::interval;

use crate::config::SyncConfig;
use crate::error;
use crate::survey::orchestrator::{self, RunSummary};

/// Counters across the daemon's lifetime.
#[derive(Debug, Clone, Default)]
pub struct DaemonStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub total_rows: u64,
}

impl DaemonStats {
    fn record(&mut self, summary: &RunSummary) {
        self.total_rows += summary.total_rows;
    }
}

pub struct SurveyDaemon {
    config: SyncConfig,
}

impl SurveyDaemon {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Run one cycle on a fresh connection.
    pub async fn run_cycle(&self, stop: watch::Receiver<bool>) -> Result<RunSummary> {
        let backend = orchestrator::connect_backend(&self.config).await?;
        orchestrator::execute_with(&backend, &self.config, orchestrator::now(), Some(stop)).await
    }

    /// Run until `shutdown` reads true.
    ///
    /// Connection and discovery failures are logged and retried on the next
    /// tick; fatal errors stop the daemon.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<DaemonStats> {
        let mut ticker = interval(self.config.poll_interval);
        let mut stats = DaemonStats::default();

        tracing::info!(
            "Starting survey sync daemon with poll_interval={:?}",
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received, stopping survey sync daemon");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    stats.cycles += 1;
                    tracing::info!("Starting sync cycle {}", stats.cycles);

                    match self.run_cycle(shutdown.clone()).await {
                        Ok(summary) => stats.record(&summary),
                        Err(e) if error::is_fatal(&e) => {
                            tracing::error!("Sync cycle {} hit a fatal error: {:?}", stats.cycles, e);
                            return Err(e);
                        }
                        Err(e) => {
                            stats.failed_cycles += 1;
                            tracing::error!("Sync cycle {} failed: {:?}", stats.cycles, e);
                        }
                    }

                    if *shutdown.borrow() {
                        tracing::info!("Shutdown signal received during sync cycle, stopping");
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "Survey sync daemon stopped after {} cycle(s), {} row(s) written",
            stats.cycles,
            stats.total_rows
        );
        Ok(stats)
    }
}
