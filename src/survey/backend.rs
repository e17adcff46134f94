// ABOUTME: Async trait seams between the sync engine and its databases
// ABOUTME: Source queries, destination store, and page registry, plus the records they exchange

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::filters::PageFilter;
use crate::survey::value::{FieldValue, ValueType};

/// A survey page that has actions newer than its checkpoint (or was never synced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCandidate {
    pub page_id: i64,
    pub latest_action: NaiveDateTime,
    pub last_refresh: Option<NaiveDateTime>,
}

/// Which survey pages discovery should return.
///
/// The due and lookback rules are applied before `limit`, so pages that
/// would be skipped never take a slot from pages that would sync.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub filter: PageFilter,
    pub limit: usize,
    /// A page with a checkpoint is due once the checkpoint is at or before this.
    pub due_cutoff: NaiveDateTime,
    /// A never-synced page qualifies only with an action after this.
    pub first_sync_after: Option<NaiveDateTime>,
}

impl CandidateQuery {
    /// The discovery rule shared by every backend.
    pub fn admits(&self, latest_action: NaiveDateTime, last_refresh: Option<NaiveDateTime>) -> bool {
        match last_refresh {
            None => self
                .first_sync_after
                .map_or(true, |after| latest_action > after),
            Some(checkpoint) => latest_action > checkpoint && checkpoint <= self.due_cutoff,
        }
    }
}

/// Source-side facts about one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page_type: String,
    pub action_count: i64,
}

/// One `(action_id, field_name, value, created_at)` tuple from the source.
///
/// Actions without any field produce a single row with `field_name = None`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRow {
    pub action_id: i64,
    pub field_name: Option<String>,
    pub value: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Window query for one page: `created_at` in `(since, upper]` (or `[since, upper]`),
/// at most `cap` actions.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub page_id: i64,
    pub since: NaiveDateTime,
    pub upper: NaiveDateTime,
    /// Read `[since, upper]` instead; set for an explicit re-read from a timestamp.
    pub inclusive_since: bool,
    pub cap: usize,
    pub exclude_fields: Vec<String>,
}

impl FetchRequest {
    /// True if an action created at `at` falls in the window.
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        let after_lower = if self.inclusive_since {
            at >= self.since
        } else {
            at > self.since
        };
        after_lower && at <= self.upper
    }

    /// SQL comparison operator for the lower bound.
    pub fn lower_operator(&self) -> &'static str {
        if self.inclusive_since {
            ">="
        } else {
            ">"
        }
    }
}

/// Result of a window query.
///
/// When `capped` is set, `upper_bound` has been lowered to the `created_at`
/// of the last included action and every action at that timestamp is present.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub rows: Vec<FieldRow>,
    pub upper_bound: NaiveDateTime,
    pub capped: bool,
}

/// A destination column other than `action_id` / `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub value_type: ValueType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// One denormalized destination row; `values` is aligned with the column slice
/// it is written with.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRow {
    pub action_id: i64,
    pub created_at: NaiveDateTime,
    pub values: Vec<FieldValue>,
}

/// Registry entry for a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_id: i64,
    pub column_list: Vec<String>,
    pub last_refresh: Option<NaiveDateTime>,
}

/// Read-only access to the ActionKit tables.
#[async_trait]
pub trait SurveySource: Send + Sync {
    /// Survey pages due for a sync, newest page id first.
    async fn candidate_pages(&self, query: &CandidateQuery) -> Result<Vec<PageCandidate>>;

    /// `None` if the page does not exist.
    async fn page_info(&self, page_id: i64) -> Result<Option<PageInfo>>;

    async fn fetch_window(&self, request: &FetchRequest) -> Result<SourceBatch>;
}

/// The `page_{id}` tables.
#[async_trait]
pub trait SurveyStore: Send + Sync {
    /// Field columns of `page_{id}`, or `None` if the table does not exist.
    async fn table_columns(&self, page_id: i64) -> Result<Option<Vec<ColumnDef>>>;

    async fn create_table(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()>;

    async fn add_columns(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()>;

    /// Insert or overwrite rows keyed by `action_id`. Returns rows written.
    async fn upsert_rows(&self, page_id: i64, columns: &[ColumnDef], rows: &[ActionRow]) -> Result<u64>;

    /// `None` if the table does not exist.
    async fn row_count(&self, page_id: i64) -> Result<Option<i64>>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// The `pages` registry table.
#[async_trait]
pub trait PageRegistry: Send + Sync {
    /// Create the survey schema and registry table if missing.
    async fn ensure_registry(&self) -> Result<()>;

    /// Fails with `RegistryInvalid` if a required column is missing.
    async fn verify_registry(&self) -> Result<()>;

    async fn load_page(&self, page_id: i64) -> Result<Option<PageRecord>>;

    /// Add a never-synced record. No-op if the page is already registered.
    async fn register_page(&self, page_id: i64) -> Result<()>;

    async fn save_column_list(&self, page_id: i64, columns: &[String]) -> Result<()>;

    /// Set `last_refresh = new` only if it still equals `expected`.
    ///
    /// Returns false when another writer moved the checkpoint first.
    async fn advance_checkpoint(
        &self,
        page_id: i64,
        expected: Option<NaiveDateTime>,
        new: NaiveDateTime,
    ) -> Result<bool>;
}

/// Everything a sync run needs from one connection.
pub trait SurveyBackend: SurveySource + SurveyStore + PageRegistry {}

impl<T: SurveySource + SurveyStore + PageRegistry> SurveyBackend for T {}
