// ABOUTME: Read-only reporting on survey pages: refresh info and the due listing
// ABOUTME: Reports page type, registry state, and source versus saved row counts

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::SurveySyncError;
use crate::survey::backend::{PageCandidate, SurveyBackend};
use crate::survey::orchestrator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshInfo {
    pub page_id: i64,
    pub page_type: String,
    pub column_list: Vec<String>,
    pub last_refresh: Option<NaiveDateTime>,
    /// Actions for the page in the source
    pub action_count: i64,
    /// Rows in `page_{id}`
    pub saved_count: i64,
}

impl RefreshInfo {
    /// Source actions not yet materialized. Can be negative if source rows were deleted.
    pub fn pending_count(&self) -> i64 {
        self.action_count - self.saved_count
    }
}

/// Refresh state of one survey page.
///
/// Fails with `PageNotFound`, `PageNotSurvey`, or `PageNotLoaded`.
pub async fn refresh_info<B>(backend: &B, page_id: i64) -> Result<RefreshInfo>
where
    B: SurveyBackend + ?Sized,
{
    let info = backend
        .page_info(page_id)
        .await?
        .ok_or(SurveySyncError::PageNotFound(page_id))?;
    if info.page_type != "Survey" {
        return Err(SurveySyncError::PageNotSurvey(page_id).into());
    }

    let record = backend
        .load_page(page_id)
        .await?
        .ok_or(SurveySyncError::PageNotLoaded(page_id))?;
    let saved_count = backend.row_count(page_id).await?.unwrap_or(0);

    Ok(RefreshInfo {
        page_id,
        page_type: info.page_type,
        column_list: record.column_list,
        last_refresh: record.last_refresh,
        action_count: info.action_count,
        saved_count,
    })
}

/// Survey pages a run at `now` would sync, newest page id first.
pub async fn due_pages<B>(
    backend: &B,
    config: &SyncConfig,
    now: NaiveDateTime,
) -> Result<Vec<PageCandidate>>
where
    B: SurveyBackend + ?Sized,
{
    backend
        .candidate_pages(&orchestrator::candidate_query(config, now))
        .await
}
