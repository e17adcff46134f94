// ABOUTME: Catch-up scheduler - drives each due page through successive capped windows
// ABOUTME: Isolates page failures, guards checkpoint writes, and stops between pages on request

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{self, SurveySyncError};
use crate::survey::backend::{PageRecord, SurveyBackend};
use crate::survey::engine::{EngineOptions, PageSyncEngine, SyncOutcome, SyncWindow};

/// Per-page state within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Pending,
    Syncing,
    CaughtUp,
    Failed,
    /// Not due yet, or the run was stopped before reaching the page.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOutcome {
    pub page_id: i64,
    pub state: PageState,
    pub rows_written: u64,
    pub batches: usize,
    pub checkpoint_before: Option<NaiveDateTime>,
    pub checkpoint_after: Option<NaiveDateTime>,
    /// The batch limit was reached with actions still pending.
    pub more_pending: bool,
    pub error: Option<String>,
}

impl PageOutcome {
    fn new(page_id: i64, checkpoint: Option<NaiveDateTime>) -> Self {
        Self {
            page_id,
            state: PageState::Pending,
            rows_written: 0,
            batches: 0,
            checkpoint_before: checkpoint,
            checkpoint_after: checkpoint,
            more_pending: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub engine: EngineOptions,
    pub refresh_interval: Duration,
    /// Never-synced pages start at `now - lookback`.
    pub lookback: Option<Duration>,
    pub max_batches_per_page: Option<usize>,
}

/// Lower bound for a page that has never been synced.
pub fn initial_lower_bound(now: NaiveDateTime, lookback: Option<Duration>) -> NaiveDateTime {
    let beginning = chrono::NaiveDate::from_ymd_opt(1900, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN);
    match lookback.and_then(|l| chrono::Duration::from_std(l).ok()) {
        Some(lookback) => now
            .checked_sub_signed(lookback)
            .map(|start| start.max(beginning))
            .unwrap_or(beginning),
        None => beginning,
    }
}

/// True if the page was never refreshed or its checkpoint is at least `interval` old.
pub fn is_due(last_refresh: Option<NaiveDateTime>, now: NaiveDateTime, interval: Duration) -> bool {
    match last_refresh {
        None => true,
        Some(last) => match (now - last).to_std() {
            Ok(age) => age >= interval,
            // checkpoint in the future: nothing can be due
            Err(_) => false,
        },
    }
}

/// Latest checkpoint that is due at `now`; agrees with [`is_due`] for every checkpoint.
pub fn due_cutoff(now: NaiveDateTime, interval: Duration) -> NaiveDateTime {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|interval| now.checked_sub_signed(interval))
        .unwrap_or(NaiveDateTime::MIN)
}

pub struct CatchUpScheduler<'a, B: ?Sized> {
    backend: &'a B,
    options: &'a SchedulerOptions,
    stop: Option<watch::Receiver<bool>>,
}

impl<'a, B> CatchUpScheduler<'a, B>
where
    B: SurveyBackend + ?Sized,
{
    pub fn new(backend: &'a B, options: &'a SchedulerOptions) -> Self {
        Self {
            backend,
            options,
            stop: None,
        }
    }

    /// Observe `stop`; once it reads true no further page is started.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().map(|s| *s.borrow()).unwrap_or(false)
    }

    /// Sync every due page in order.
    ///
    /// Page failures are recorded in the returned outcomes. Only fatal errors
    /// (a broken registry) are returned as `Err`.
    pub async fn run(&self, pages: &[i64], now: NaiveDateTime) -> Result<Vec<PageOutcome>> {
        let mut outcomes = Vec::with_capacity(pages.len());

        for &page_id in pages {
            if self.stop_requested() {
                tracing::info!("Stop requested; not starting page {}", page_id);
                let mut outcome = PageOutcome::new(page_id, None);
                outcome.state = PageState::Skipped;
                outcomes.push(outcome);
                continue;
            }

            let record = match self.backend.load_page(page_id).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("Failed to load registry record for page {}: {:?}", page_id, e);
                    let mut outcome = PageOutcome::new(page_id, None);
                    outcome.state = PageState::Failed;
                    outcome.error = Some(format!("{:#}", e));
                    outcomes.push(outcome);
                    continue;
                }
            };
            let last_refresh = record.as_ref().and_then(|r| r.last_refresh);

            if !is_due(last_refresh, now, self.options.refresh_interval) {
                tracing::debug!("Page {} is not due (last refresh {:?})", page_id, last_refresh);
                let mut outcome = PageOutcome::new(page_id, last_refresh);
                outcome.state = PageState::Skipped;
                outcomes.push(outcome);
                continue;
            }

            outcomes.push(self.catch_up(page_id, record, now, None).await?);
        }

        Ok(outcomes)
    }

    /// Catch one page up regardless of its refresh interval.
    ///
    /// `since` replaces the lower bound of the first window, and actions at
    /// exactly `since` are read too; the checkpoint still only moves forward.
    pub async fn sync_page(
        &self,
        page_id: i64,
        now: NaiveDateTime,
        since: Option<NaiveDateTime>,
    ) -> Result<PageOutcome> {
        let record = self.backend.load_page(page_id).await?;
        self.catch_up(page_id, record, now, since).await
    }

    async fn catch_up(
        &self,
        page_id: i64,
        record: Option<PageRecord>,
        now: NaiveDateTime,
        since: Option<NaiveDateTime>,
    ) -> Result<PageOutcome> {
        let mut record = record.unwrap_or(PageRecord {
            page_id,
            column_list: Vec::new(),
            last_refresh: None,
        });
        let mut outcome = PageOutcome::new(page_id, record.last_refresh);
        outcome.state = PageState::Syncing;

        let mut lower = since
            .or(record.last_refresh)
            .unwrap_or_else(|| initial_lower_bound(now, self.options.lookback));
        let mut inclusive_since = since.is_some();
        tracing::info!("Syncing page {} from {}", page_id, lower);

        loop {
            if let Some(limit) = self.options.max_batches_per_page {
                if outcome.batches >= limit {
                    tracing::info!(
                        "Page {} reached the limit of {} batch(es); remaining actions wait for the next run",
                        page_id,
                        limit
                    );
                    outcome.more_pending = true;
                    break;
                }
            }

            outcome.batches += 1;
            let window = SyncWindow {
                since: lower,
                upper: now,
                inclusive_since,
            };
            let batch = match self.run_batch(&record, window).await {
                Ok(batch) => batch,
                Err(e) => {
                    if error::is_fatal(&e) {
                        return Err(e);
                    }
                    tracing::error!("Page {} failed: {:?}", page_id, e);
                    outcome.state = PageState::Failed;
                    outcome.error = Some(format!("{:#}", e));
                    return Ok(outcome);
                }
            };

            outcome.rows_written += batch.rows_written;
            if let Some(reloaded) = self.reload(page_id).await {
                record = reloaded;
            }
            outcome.checkpoint_after = record.last_refresh;

            if !batch.capped {
                break;
            }
            lower = batch.upper_bound;
            inclusive_since = false;
        }

        outcome.state = PageState::CaughtUp;
        tracing::info!(
            "Page {} caught up: {} row(s) in {} batch(es), checkpoint {:?}",
            page_id,
            outcome.rows_written,
            outcome.batches,
            outcome.checkpoint_after
        );
        Ok(outcome)
    }

    async fn reload(&self, page_id: i64) -> Option<PageRecord> {
        match self.backend.load_page(page_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to reload registry record for page {}: {}", page_id, e);
                None
            }
        }
    }

    /// One window inside one transaction: registry row, DDL, upserts, checkpoint.
    async fn run_batch(&self, record: &PageRecord, window: SyncWindow) -> Result<SyncOutcome> {
        self.backend.begin().await?;

        match self.write_batch(record, window).await {
            Ok(outcome) => {
                self.backend.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = self.backend.rollback().await {
                    tracing::warn!(
                        "Rollback failed for page {}: {}",
                        record.page_id,
                        rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_batch(&self, record: &PageRecord, window: SyncWindow) -> Result<SyncOutcome> {
        let page_id = record.page_id;
        self.backend.register_page(page_id).await?;

        let engine = PageSyncEngine::new(self.backend, &self.options.engine);
        let outcome = engine.sync(record, window).await?;

        if let Some(new_checkpoint) = outcome.new_checkpoint {
            let advances = record
                .last_refresh
                .map_or(true, |current| new_checkpoint > current);
            if advances {
                let written = self
                    .backend
                    .advance_checkpoint(page_id, record.last_refresh, new_checkpoint)
                    .await?;
                if !written {
                    return Err(SurveySyncError::CheckpointConflict { page_id }.into());
                }
            }
        }

        Ok(outcome)
    }
}
