// ABOUTME: Page sync engine - turns one window of field rows into upserted page_{id} rows
// ABOUTME: Groups rows per action, infers column types, reconciles the table, and upserts

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};

use crate::survey::backend::{
    ActionRow, ColumnDef, FetchRequest, FieldRow, PageRecord, SurveyBackend,
};
use crate::survey::columns::column_name;
use crate::survey::reconciler::{FieldDefinition, SchemaReconciler};
use crate::survey::value::{FieldValue, TypeInference, ValueType};

/// Separator for repeated fields (checkbox groups) and fields whose names
/// map to the same column.
pub const MULTI_VALUE_SEPARATOR: &str = "; ";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum actions per window
    pub batch_size: usize,
    pub exclude_fields: Vec<String>,
    pub infer_types: bool,
}

/// Time window for one batch: `created_at` in `(since, upper]`, or
/// `[since, upper]` when `inclusive_since` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub since: NaiveDateTime,
    pub upper: NaiveDateTime,
    pub inclusive_since: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub actions: usize,
    pub rows_written: u64,
    /// Max `created_at` written, or the page's previous checkpoint if nothing was.
    pub new_checkpoint: Option<NaiveDateTime>,
    /// The window hit the batch cap; actions after `upper_bound` remain.
    pub capped: bool,
    pub upper_bound: NaiveDateTime,
    pub columns_added: usize,
}

/// One action's fields, keyed by destination column.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub action_id: i64,
    pub created_at: NaiveDateTime,
    pub values: BTreeMap<String, String>,
}

/// Group field rows by action, in first-seen order.
///
/// Values landing in the same column of one action are joined with
/// [`MULTI_VALUE_SEPARATOR`] in source order. Returns the records and every
/// column named in the batch.
pub fn group_actions(rows: &[FieldRow]) -> (Vec<ActionRecord>, Vec<String>) {
    let mut records: Vec<ActionRecord> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut columns: Vec<String> = Vec::new();

    for row in rows {
        let slot = *index.entry(row.action_id).or_insert_with(|| {
            records.push(ActionRecord {
                action_id: row.action_id,
                created_at: row.created_at,
                values: BTreeMap::new(),
            });
            records.len() - 1
        });

        let Some(ref field_name) = row.field_name else {
            continue;
        };
        let column = column_name(field_name);
        if !columns.contains(&column) {
            columns.push(column.clone());
        }

        let value = row.value.clone().unwrap_or_default();
        let record = &mut records[slot];
        match record.values.get_mut(&column) {
            Some(existing) if existing.is_empty() => *existing = value,
            Some(existing) => {
                if !value.is_empty() {
                    existing.push_str(MULTI_VALUE_SEPARATOR);
                    existing.push_str(&value);
                }
            }
            None => {
                record.values.insert(column, value);
            }
        }
    }

    columns.sort();
    (records, columns)
}

/// Infer one type per column from every action's merged value.
pub fn infer_fields(records: &[ActionRecord], columns: &[String]) -> Vec<FieldDefinition> {
    columns
        .iter()
        .map(|column| {
            let mut inference = TypeInference::new();
            for record in records {
                if let Some(value) = record.values.get(column) {
                    inference.observe(value);
                }
            }
            FieldDefinition {
                name: column.clone(),
                value_type: inference.resolve(),
                has_values: inference.has_evidence(),
                parses_as: inference.parseable_types(),
            }
        })
        .collect()
}

pub struct PageSyncEngine<'a, B: ?Sized> {
    backend: &'a B,
    options: &'a EngineOptions,
}

impl<'a, B> PageSyncEngine<'a, B>
where
    B: SurveyBackend + ?Sized,
{
    pub fn new(backend: &'a B, options: &'a EngineOptions) -> Self {
        Self { backend, options }
    }

    /// Sync one window of `page`. Does not touch the checkpoint; the caller
    /// persists `new_checkpoint` after this returns.
    pub async fn sync(&self, page: &PageRecord, window: SyncWindow) -> Result<SyncOutcome> {
        let page_id = page.page_id;
        let request = FetchRequest {
            page_id,
            since: window.since,
            upper: window.upper,
            inclusive_since: window.inclusive_since,
            cap: self.options.batch_size,
            exclude_fields: self.options.exclude_fields.clone(),
        };
        let batch = self
            .backend
            .fetch_window(&request)
            .await
            .with_context(|| format!("Failed to fetch actions for page {}", page_id))?;

        if batch.rows.is_empty() {
            tracing::debug!(
                "Page {}: no actions from {} to {}",
                page_id,
                window.since,
                batch.upper_bound
            );
            return Ok(SyncOutcome {
                actions: 0,
                rows_written: 0,
                new_checkpoint: page.last_refresh,
                capped: false,
                upper_bound: batch.upper_bound,
                columns_added: 0,
            });
        }

        let (records, column_names) = group_actions(&batch.rows);
        let fields = infer_fields(&records, &column_names);

        let reconciler = SchemaReconciler::new(self.backend, self.options.infer_types);
        let schema = reconciler.reconcile(page_id, &page.column_list, &fields).await?;

        let columns: Vec<ColumnDef> = column_names
            .iter()
            .map(|name| {
                ColumnDef::new(
                    name.clone(),
                    schema.column_type(name).unwrap_or(ValueType::Text),
                )
            })
            .collect();
        let rows = build_rows(page_id, &records, &columns);

        let rows_written = self
            .backend
            .upsert_rows(page_id, &columns, &rows)
            .await
            .with_context(|| format!("Failed to write actions for page {}", page_id))?;

        let new_checkpoint = records.iter().map(|r| r.created_at).max();
        tracing::info!(
            "Page {}: wrote {} action(s) up to {}",
            page_id,
            rows.len(),
            batch.upper_bound
        );

        Ok(SyncOutcome {
            actions: records.len(),
            rows_written,
            new_checkpoint: new_checkpoint.or(page.last_refresh),
            capped: batch.capped,
            upper_bound: batch.upper_bound,
            columns_added: schema.added.len(),
        })
    }
}

fn build_rows(page_id: i64, records: &[ActionRecord], columns: &[ColumnDef]) -> Vec<ActionRow> {
    records
        .iter()
        .map(|record| ActionRow {
            action_id: record.action_id,
            created_at: record.created_at,
            values: columns
                .iter()
                .map(|column| match record.values.get(&column.name) {
                    Some(raw) => {
                        let value = FieldValue::coerce(raw, column.value_type);
                        if value.is_null() && !raw.trim().is_empty() {
                            tracing::warn!(
                                "Page {}: action {} value for {} is not a valid {}; storing NULL",
                                page_id,
                                record.action_id,
                                column.name,
                                column.value_type
                            );
                        }
                        value
                    }
                    None => FieldValue::Null,
                })
                .collect(),
        })
        .collect()
}
