// ABOUTME: Orchestrator - the single entry point that runs one sync cycle
// ABOUTME: Connects, verifies the registry, discovers pages, runs the scheduler, and summarizes

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::error::SurveySyncError;
use crate::postgres;
use crate::survey::backend::{CandidateQuery, SurveyBackend};
use crate::survey::engine::EngineOptions;
use crate::survey::pg::PgSurveyBackend;
use crate::survey::scheduler::{
    self, CatchUpScheduler, PageOutcome, PageState, SchedulerOptions,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFailure {
    pub page_id: i64,
    pub error: String,
}

/// Result of one run. A run with failed pages still completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pages_succeeded: usize,
    pub pages_failed: usize,
    pub pages_skipped: usize,
    pub total_rows: u64,
    pub failures: Vec<PageFailure>,
    pub outcomes: Vec<PageOutcome>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: Vec<PageOutcome>, duration_ms: u64) -> Self {
        let mut summary = RunSummary {
            duration_ms,
            ..Default::default()
        };
        for outcome in &outcomes {
            summary.total_rows += outcome.rows_written;
            match outcome.state {
                PageState::CaughtUp => summary.pages_succeeded += 1,
                PageState::Failed => {
                    summary.pages_failed += 1;
                    summary.failures.push(PageFailure {
                        page_id: outcome.page_id,
                        error: outcome.error.clone().unwrap_or_default(),
                    });
                }
                PageState::Skipped | PageState::Pending | PageState::Syncing => {
                    summary.pages_skipped += 1
                }
            }
        }
        summary.outcomes = outcomes;
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.pages_failed == 0
    }

    pub fn log(&self) {
        tracing::info!(
            "Sync run finished in {}ms: {} succeeded, {} failed, {} skipped, {} row(s) written",
            self.duration_ms,
            self.pages_succeeded,
            self.pages_failed,
            self.pages_skipped,
            self.total_rows
        );
        for failure in &self.failures {
            tracing::warn!("  page {}: {}", failure.page_id, failure.error);
        }
    }
}

/// Discovery request for a run at `now`: the refresh interval and lookback
/// narrow the candidates before `max_pages` is applied.
pub fn candidate_query(config: &SyncConfig, now: NaiveDateTime) -> CandidateQuery {
    CandidateQuery {
        filter: config.page_filter.clone(),
        limit: config.max_pages,
        due_cutoff: scheduler::due_cutoff(now, config.refresh_interval),
        first_sync_after: config
            .lookback
            .map(|_| scheduler::initial_lower_bound(now, config.lookback)),
    }
}

pub fn scheduler_options(config: &SyncConfig) -> SchedulerOptions {
    SchedulerOptions {
        engine: EngineOptions {
            batch_size: config.batch_size,
            exclude_fields: config.column_excludes.clone(),
            infer_types: config.infer_types,
        },
        refresh_interval: config.refresh_interval,
        lookback: config.lookback,
        max_batches_per_page: config.max_batches_per_page,
    }
}

/// Open the configured database as a survey backend.
pub async fn connect_backend(config: &SyncConfig) -> Result<PgSurveyBackend> {
    config.validate()?;
    let client = postgres::connect_with_retry(&config.database_url)
        .await
        .context("Failed to connect to the ActionKit database")?;
    if let Some(timeout) = config.statement_timeout {
        postgres::apply_statement_timeout(&client, timeout).await?;
    }
    Ok(PgSurveyBackend::new(client, config))
}

/// Run one sync cycle against the configured database.
pub async fn execute(config: &SyncConfig) -> Result<RunSummary> {
    let backend = connect_backend(config).await?;
    execute_with(&backend, config, now(), None).await
}

/// Run one sync cycle against `backend`.
///
/// Returns `Err` only for fatal errors (setup, registry, discovery); page
/// failures are reported in the summary.
pub async fn execute_with<B>(
    backend: &B,
    config: &SyncConfig,
    now: NaiveDateTime,
    stop: Option<watch::Receiver<bool>>,
) -> Result<RunSummary>
where
    B: SurveyBackend + ?Sized,
{
    let started = Instant::now();

    backend
        .ensure_registry()
        .await
        .context("Failed to prepare the page registry")?;
    backend.verify_registry().await?;

    let candidates = backend
        .candidate_pages(&candidate_query(config, now))
        .await
        .context("Failed to discover surveys that need updating")?;
    let pages: Vec<i64> = candidates.iter().map(|c| c.page_id).collect();
    tracing::info!("{} survey(s) need updating: {:?}", pages.len(), pages);

    let options = scheduler_options(config);
    let mut scheduler = CatchUpScheduler::new(backend, &options);
    if let Some(stop) = stop {
        scheduler = scheduler.with_stop_signal(stop);
    }
    let outcomes = scheduler.run(&pages, now).await?;

    let summary = RunSummary::from_outcomes(outcomes, started.elapsed().as_millis() as u64);
    summary.log();
    Ok(summary)
}

/// Catch one survey page up, ignoring the refresh interval.
pub async fn execute_page<B>(
    backend: &B,
    config: &SyncConfig,
    page_id: i64,
    since: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> Result<PageOutcome>
where
    B: SurveyBackend + ?Sized,
{
    backend
        .ensure_registry()
        .await
        .context("Failed to prepare the page registry")?;
    backend.verify_registry().await?;

    let info = backend
        .page_info(page_id)
        .await?
        .ok_or(SurveySyncError::PageNotFound(page_id))?;
    if info.page_type != "Survey" {
        return Err(SurveySyncError::PageNotSurvey(page_id).into());
    }

    let options = scheduler_options(config);
    let outcome = CatchUpScheduler::new(backend, &options)
        .sync_page(page_id, now, since)
        .await?;
    Ok(outcome)
}

/// Upper bound of every window in a run.
pub fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}
