// ABOUTME: In-process survey backend holding source actions, page tables, and the registry
// ABOUTME: Supports batch transactions and per-page fault injection for exercising the engine

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::SurveySyncError;
use crate::survey::backend::{
    ActionRow, CandidateQuery, ColumnDef, FetchRequest, FieldRow, PageCandidate, PageInfo,
    PageRecord, PageRegistry, SourceBatch, SurveySource, SurveyStore,
};
use crate::survey::value::FieldValue;

const REGISTRY_COLUMNS: &[&str] = &["page_id", "column_list", "last_refresh"];

/// A source action as it would appear across `core_action` / `core_actionfield`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAction {
    pub action_id: i64,
    pub created_at: NaiveDateTime,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
struct SourcePage {
    page_type: String,
    actions: Vec<SourceAction>,
}

/// A stored destination row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub created_at: NaiveDateTime,
    pub values: BTreeMap<String, FieldValue>,
}

impl StoredRow {
    /// Value of `column`, `Null` when the column was never written for this row.
    pub fn get(&self, column: &str) -> FieldValue {
        self.values.get(column).cloned().unwrap_or(FieldValue::Null)
    }
}

/// Snapshot of one `page_{id}` table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MemoryTable {
    pub columns: Vec<ColumnDef>,
    pub rows: BTreeMap<i64, StoredRow>,
}

impl MemoryTable {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Default)]
struct Durable {
    tables: BTreeMap<i64, MemoryTable>,
    registry: BTreeMap<i64, PageRecord>,
    registry_created: bool,
}

#[derive(Debug, Default)]
struct Faults {
    source: HashSet<i64>,
    ddl: HashSet<i64>,
    upsert: HashSet<i64>,
    checkpoint: HashSet<i64>,
}

#[derive(Debug)]
struct State {
    pages: BTreeMap<i64, SourcePage>,
    durable: Durable,
    snapshot: Option<Durable>,
    registry_columns: Vec<String>,
    faults: Faults,
    ddl_count: usize,
    upsert_count: usize,
}

/// Backend kept entirely in memory. All interfaces share one state, the way
/// one database connection serves source, destination, and registry.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pages: BTreeMap::new(),
                durable: Durable::default(),
                snapshot: None,
                registry_columns: REGISTRY_COLUMNS.iter().map(|c| c.to_string()).collect(),
                faults: Faults::default(),
                ddl_count: 0,
                upsert_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a source page of the given type (`Survey`, `Petition`, ...).
    pub fn add_page(&self, page_id: i64, page_type: &str) {
        self.lock().pages.insert(
            page_id,
            SourcePage {
                page_type: page_type.to_string(),
                actions: Vec::new(),
            },
        );
    }

    /// Add a source action; the page is created as a survey if unknown.
    pub fn add_action(
        &self,
        page_id: i64,
        action_id: i64,
        created_at: NaiveDateTime,
        fields: &[(&str, &str)],
    ) {
        let mut state = self.lock();
        let page = state.pages.entry(page_id).or_insert_with(|| SourcePage {
            page_type: "Survey".to_string(),
            actions: Vec::new(),
        });
        page.actions.push(SourceAction {
            action_id,
            created_at,
            fields: fields
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        });
    }

    /// Write a registry record directly, bypassing the conditional write.
    pub fn set_checkpoint(&self, page_id: i64, last_refresh: Option<NaiveDateTime>) {
        let mut state = self.lock();
        state.durable.registry_created = true;
        let record = state
            .durable
            .registry
            .entry(page_id)
            .or_insert_with(|| PageRecord {
                page_id,
                column_list: Vec::new(),
                last_refresh: None,
            });
        record.last_refresh = last_refresh;
    }

    pub fn page_record(&self, page_id: i64) -> Option<PageRecord> {
        self.lock().durable.registry.get(&page_id).cloned()
    }

    pub fn table(&self, page_id: i64) -> Option<MemoryTable> {
        self.lock().durable.tables.get(&page_id).cloned()
    }

    /// Make source queries for `page_id` fail.
    pub fn fail_source(&self, page_id: i64) {
        self.lock().faults.source.insert(page_id);
    }

    /// Make table creation and column additions for `page_id` fail.
    pub fn fail_ddl(&self, page_id: i64) {
        self.lock().faults.ddl.insert(page_id);
    }

    /// Make upserts into `page_{id}` fail.
    pub fn fail_upsert(&self, page_id: i64) {
        self.lock().faults.upsert.insert(page_id);
    }

    /// Make the next checkpoint writes for `page_id` lose the race to another writer.
    pub fn conflict_checkpoint(&self, page_id: i64) {
        self.lock().faults.checkpoint.insert(page_id);
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    /// Remove a registry column so verification fails.
    pub fn drop_registry_column(&self, column: &str) {
        self.lock().registry_columns.retain(|c| c != column);
    }

    /// DDL statements issued so far (table creations and column additions).
    pub fn ddl_count(&self) -> usize {
        self.lock().ddl_count
    }

    /// Upsert calls that wrote at least one row.
    pub fn upsert_count(&self) -> usize {
        self.lock().upsert_count
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }
}

fn sorted_actions(page: &SourcePage) -> Vec<&SourceAction> {
    let mut actions: Vec<&SourceAction> = page.actions.iter().collect();
    actions.sort_by_key(|a| (a.created_at, a.action_id));
    actions
}

#[async_trait]
impl SurveySource for MemoryBackend {
    async fn candidate_pages(&self, query: &CandidateQuery) -> Result<Vec<PageCandidate>> {
        let state = self.lock();
        let mut candidates: Vec<PageCandidate> = state
            .pages
            .iter()
            .filter(|(page_id, page)| {
                page.page_type == "Survey" && query.filter.should_sync_page(**page_id)
            })
            .filter_map(|(page_id, page)| {
                let latest_action = page.actions.iter().map(|a| a.created_at).max()?;
                let last_refresh = state
                    .durable
                    .registry
                    .get(page_id)
                    .and_then(|r| r.last_refresh);
                query
                    .admits(latest_action, last_refresh)
                    .then_some(PageCandidate {
                        page_id: *page_id,
                        latest_action,
                        last_refresh,
                    })
            })
            .collect();
        candidates.sort_by(|a, b| b.page_id.cmp(&a.page_id));
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    async fn page_info(&self, page_id: i64) -> Result<Option<PageInfo>> {
        Ok(self.lock().pages.get(&page_id).map(|page| PageInfo {
            page_type: page.page_type.clone(),
            action_count: page.actions.len() as i64,
        }))
    }

    async fn fetch_window(&self, request: &FetchRequest) -> Result<SourceBatch> {
        let state = self.lock();
        if state.faults.source.contains(&request.page_id) {
            bail!("source query failed for page {}", request.page_id);
        }
        let Some(page) = state.pages.get(&request.page_id) else {
            return Ok(SourceBatch {
                rows: Vec::new(),
                upper_bound: request.upper,
                capped: false,
            });
        };

        let in_window: Vec<&SourceAction> = sorted_actions(page)
            .into_iter()
            .filter(|a| request.contains(a.created_at))
            .collect();

        let (upper_bound, capped) = match in_window.get(request.cap.saturating_sub(1)) {
            Some(boundary) if request.cap > 0 => (boundary.created_at, true),
            _ => (request.upper, false),
        };

        let mut rows = Vec::new();
        for action in in_window.iter().filter(|a| a.created_at <= upper_bound) {
            let before = rows.len();
            for (name, value) in &action.fields {
                if request.exclude_fields.contains(name) {
                    continue;
                }
                rows.push(FieldRow {
                    action_id: action.action_id,
                    field_name: Some(name.clone()),
                    value: Some(value.clone()),
                    created_at: action.created_at,
                });
            }
            if rows.len() == before {
                rows.push(FieldRow {
                    action_id: action.action_id,
                    field_name: None,
                    value: None,
                    created_at: action.created_at,
                });
            }
        }

        Ok(SourceBatch {
            rows,
            upper_bound,
            capped,
        })
    }
}

#[async_trait]
impl SurveyStore for MemoryBackend {
    async fn table_columns(&self, page_id: i64) -> Result<Option<Vec<ColumnDef>>> {
        Ok(self
            .lock()
            .durable
            .tables
            .get(&page_id)
            .map(|t| t.columns.clone()))
    }

    async fn create_table(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()> {
        let mut state = self.lock();
        if state.faults.ddl.contains(&page_id) {
            bail!("permission denied to create table page_{}", page_id);
        }
        if state.durable.tables.contains_key(&page_id) {
            bail!("relation \"page_{}\" already exists", page_id);
        }
        state.durable.tables.insert(
            page_id,
            MemoryTable {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
            },
        );
        state.ddl_count += 1;
        Ok(())
    }

    async fn add_columns(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()> {
        let mut state = self.lock();
        if state.faults.ddl.contains(&page_id) {
            bail!("permission denied to alter table page_{}", page_id);
        }
        let table = state
            .durable
            .tables
            .get_mut(&page_id)
            .ok_or_else(|| anyhow!("relation \"page_{}\" does not exist", page_id))?;
        for column in columns {
            if table.columns.iter().any(|c| c.name == column.name) {
                bail!("column \"{}\" of relation \"page_{}\" already exists", column.name, page_id);
            }
            table.columns.push(column.clone());
        }
        state.ddl_count += columns.len();
        Ok(())
    }

    async fn upsert_rows(&self, page_id: i64, columns: &[ColumnDef], rows: &[ActionRow]) -> Result<u64> {
        let mut state = self.lock();
        if state.faults.upsert.contains(&page_id) {
            bail!("insert into page_{} failed", page_id);
        }
        let table = state
            .durable
            .tables
            .get_mut(&page_id)
            .ok_or_else(|| anyhow!("relation \"page_{}\" does not exist", page_id))?;
        for column in columns {
            if !table.columns.iter().any(|c| c.name == column.name) {
                bail!("column \"{}\" of relation \"page_{}\" does not exist", column.name, page_id);
            }
        }
        for row in rows {
            let stored = table.rows.entry(row.action_id).or_insert_with(|| StoredRow {
                created_at: row.created_at,
                values: BTreeMap::new(),
            });
            stored.created_at = row.created_at;
            for (column, value) in columns.iter().zip(&row.values) {
                stored.values.insert(column.name.clone(), value.clone());
            }
        }
        if !rows.is_empty() {
            state.upsert_count += 1;
        }
        Ok(rows.len() as u64)
    }

    async fn row_count(&self, page_id: i64) -> Result<Option<i64>> {
        Ok(self
            .lock()
            .durable
            .tables
            .get(&page_id)
            .map(|t| t.rows.len() as i64))
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.lock();
        if state.snapshot.is_some() {
            bail!("transaction already in progress");
        }
        state.snapshot = Some(state.durable.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.lock();
        if state.snapshot.take().is_none() {
            bail!("no transaction in progress");
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(snapshot) = state.snapshot.take() {
            state.durable = snapshot;
        }
        Ok(())
    }
}

#[async_trait]
impl PageRegistry for MemoryBackend {
    async fn ensure_registry(&self) -> Result<()> {
        self.lock().durable.registry_created = true;
        Ok(())
    }

    async fn verify_registry(&self) -> Result<()> {
        let state = self.lock();
        let missing: Vec<String> = if state.durable.registry_created {
            REGISTRY_COLUMNS
                .iter()
                .filter(|c| !state.registry_columns.iter().any(|have| have == *c))
                .map(|c| c.to_string())
                .collect()
        } else {
            REGISTRY_COLUMNS.iter().map(|c| c.to_string()).collect()
        };
        if !missing.is_empty() {
            return Err(SurveySyncError::RegistryInvalid {
                table: "pages".to_string(),
                missing,
            }
            .into());
        }
        Ok(())
    }

    async fn load_page(&self, page_id: i64) -> Result<Option<PageRecord>> {
        Ok(self.lock().durable.registry.get(&page_id).cloned())
    }

    async fn register_page(&self, page_id: i64) -> Result<()> {
        self.lock()
            .durable
            .registry
            .entry(page_id)
            .or_insert_with(|| PageRecord {
                page_id,
                column_list: Vec::new(),
                last_refresh: None,
            });
        Ok(())
    }

    async fn save_column_list(&self, page_id: i64, columns: &[String]) -> Result<()> {
        let mut state = self.lock();
        let record = state
            .durable
            .registry
            .get_mut(&page_id)
            .ok_or_else(|| anyhow!("page {} is not registered", page_id))?;
        record.column_list = columns.to_vec();
        Ok(())
    }

    async fn advance_checkpoint(
        &self,
        page_id: i64,
        expected: Option<NaiveDateTime>,
        new: NaiveDateTime,
    ) -> Result<bool> {
        let mut state = self.lock();
        if state.faults.checkpoint.contains(&page_id) {
            return Ok(false);
        }
        match state.durable.registry.get_mut(&page_id) {
            Some(record) if record.last_refresh == expected => {
                record.last_refresh = Some(new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::PageFilter;
    use chrono::NaiveDate;

    fn ts(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn discover(due_cutoff: NaiveDateTime, first_sync_after: Option<NaiveDateTime>) -> CandidateQuery {
        CandidateQuery {
            filter: PageFilter::empty(),
            limit: 15,
            due_cutoff,
            first_sync_after,
        }
    }

    fn request(page_id: i64, cap: usize) -> FetchRequest {
        FetchRequest {
            page_id,
            since: ts(0),
            upper: ts(23),
            inclusive_since: false,
            cap,
            exclude_fields: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fetch_window_caps_at_timestamp_boundary() {
        let backend = MemoryBackend::new();
        backend.add_action(1, 10, ts(1), &[("a", "1")]);
        backend.add_action(1, 11, ts(2), &[("a", "2")]);
        backend.add_action(1, 12, ts(2), &[("a", "3")]);
        backend.add_action(1, 13, ts(3), &[("a", "4")]);

        let batch = backend.fetch_window(&request(1, 2)).await.unwrap();
        assert!(batch.capped);
        assert_eq!(batch.upper_bound, ts(2));
        let ids: Vec<i64> = batch.rows.iter().map(|r| r.action_id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_fetch_window_reports_fieldless_actions() {
        let backend = MemoryBackend::new();
        backend.add_action(1, 10, ts(1), &[("secret", "x")]);
        let mut req = request(1, 100);
        req.exclude_fields = vec!["secret".to_string()];

        let batch = backend.fetch_window(&req).await.unwrap();
        assert!(!batch.capped);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].field_name, None);
    }

    #[tokio::test]
    async fn test_rollback_restores_tables_and_registry() {
        let backend = MemoryBackend::new();
        backend.begin().await.unwrap();
        backend.register_page(1).await.unwrap();
        backend
            .create_table(1, &[ColumnDef::new("a", crate::survey::value::ValueType::Text)])
            .await
            .unwrap();
        backend.rollback().await.unwrap();

        assert!(backend.table(1).is_none());
        assert!(backend.page_record(1).is_none());
        assert!(!backend.in_transaction());
    }

    #[tokio::test]
    async fn test_advance_checkpoint_is_conditional() {
        let backend = MemoryBackend::new();
        backend.register_page(1).await.unwrap();
        assert!(backend.advance_checkpoint(1, None, ts(1)).await.unwrap());
        assert!(!backend.advance_checkpoint(1, None, ts(2)).await.unwrap());
        assert!(backend.advance_checkpoint(1, Some(ts(1)), ts(2)).await.unwrap());
        assert_eq!(backend.page_record(1).unwrap().last_refresh, Some(ts(2)));
    }

    #[tokio::test]
    async fn test_verify_registry_reports_missing_columns() {
        let backend = MemoryBackend::new();
        assert!(backend.verify_registry().await.is_err());
        backend.ensure_registry().await.unwrap();
        backend.verify_registry().await.unwrap();
        backend.drop_registry_column("last_refresh");
        let err = backend.verify_registry().await.unwrap_err();
        assert!(crate::error::is_fatal(&err));
    }

    #[tokio::test]
    async fn test_candidate_pages_skips_caught_up_and_non_surveys() {
        let backend = MemoryBackend::new();
        backend.add_action(1, 10, ts(1), &[("a", "1")]);
        backend.add_action(2, 20, ts(1), &[("a", "1")]);
        backend.add_page(3, "Petition");
        backend.add_action(3, 30, ts(1), &[("a", "1")]);
        backend.set_checkpoint(2, Some(ts(1)));

        let pages = backend.candidate_pages(&discover(ts(9), None)).await.unwrap();
        let ids: Vec<i64> = pages.iter().map(|p| p.page_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_candidate_pages_applies_due_and_lookback_before_limit() {
        let backend = MemoryBackend::new();
        // never synced, but every action predates the lookback
        backend.add_action(300, 1, ts(1), &[("a", "1")]);
        // refreshed after the due cutoff
        backend.add_action(200, 2, ts(6), &[("a", "1")]);
        backend.set_checkpoint(200, Some(ts(5)));
        // refreshed long enough ago
        backend.add_action(100, 3, ts(6), &[("a", "1")]);
        backend.set_checkpoint(100, Some(ts(2)));

        let mut query = discover(ts(4), Some(ts(3)));
        query.limit = 1;
        let pages = backend.candidate_pages(&query).await.unwrap();
        let ids: Vec<i64> = pages.iter().map(|p| p.page_id).collect();
        assert_eq!(ids, vec![100]);
    }
}
