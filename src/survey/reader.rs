// ABOUTME: SurveyReader - reads survey pages and action fields from the ActionKit schema
// ABOUTME: Windows actions by created_at and caps each window on a timestamp boundary

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tokio_postgres::Client;

use crate::filters::PageFilter;
use crate::survey::backend::{CandidateQuery, FetchRequest, FieldRow, PageCandidate, PageInfo, SourceBatch};
use crate::utils::{qualified_name, quote_literal};

/// Reads survey data from `core_page`, `core_action`, and `core_actionfield`.
///
/// Page ids are bound as `bigint` and compared against the source's integer
/// columns, so the source indexes on `page_id` stay usable.
pub struct SurveyReader<'a> {
    client: &'a Client,
    ak_schema: &'a str,
    survey_schema: &'a str,
}

impl<'a> SurveyReader<'a> {
    pub fn new(client: &'a Client, ak_schema: &'a str, survey_schema: &'a str) -> Self {
        Self {
            client,
            ak_schema,
            survey_schema,
        }
    }

    /// Survey pages that are due for a sync, highest page id first.
    pub async fn candidate_pages(&self, request: &CandidateQuery) -> Result<Vec<PageCandidate>> {
        let query = build_candidate_query(
            self.ak_schema,
            self.survey_schema,
            &request.filter,
            request.limit,
        );
        tracing::debug!("Discovering survey pages: {}", query);

        let rows = self
            .client
            .query(&query, &[&request.due_cutoff, &request.first_sync_after])
            .await
            .context("Failed to discover survey pages")?;

        Ok(rows
            .iter()
            .map(|row| PageCandidate {
                page_id: row.get(0),
                latest_action: row.get(1),
                last_refresh: row.get(2),
            })
            .collect())
    }

    /// Page type and action count, or `None` if `core_page` has no such page.
    pub async fn page_info(&self, page_id: i64) -> Result<Option<PageInfo>> {
        let query = format!(
            "SELECT p.type::varchar,
                    (SELECT COUNT(*) FROM {actions} a WHERE a.page_id = p.id)
             FROM {pages} p
             WHERE p.id = $1::bigint",
            actions = qualified_name(self.ak_schema, "core_action"),
            pages = qualified_name(self.ak_schema, "core_page"),
        );

        let row = self
            .client
            .query_opt(&query, &[&page_id])
            .await
            .with_context(|| format!("Failed to look up page {}", page_id))?;

        Ok(row.map(|row| PageInfo {
            page_type: row.get(0),
            action_count: row.get(1),
        }))
    }

    /// Read every field row for actions in the request's window, at most `cap`
    /// actions rounded up to the end of the boundary timestamp.
    pub async fn fetch_window(&self, request: &FetchRequest) -> Result<SourceBatch> {
        let (upper_bound, capped) = match self.cap_boundary(request).await? {
            Some(boundary) => (boundary, true),
            None => (request.upper, false),
        };

        let query = build_window_query(
            self.ak_schema,
            &request.exclude_fields,
            request.lower_operator(),
        );
        let rows = self
            .client
            .query(&query, &[&request.page_id, &request.since, &upper_bound])
            .await
            .with_context(|| {
                format!(
                    "Failed to read actions for page {} from {} to {}",
                    request.page_id, request.since, upper_bound
                )
            })?;

        let rows = rows
            .iter()
            .map(|row| FieldRow {
                action_id: row.get(0),
                field_name: row.get(1),
                value: row.get(2),
                created_at: row.get(3),
            })
            .collect();

        Ok(SourceBatch {
            rows,
            upper_bound,
            capped,
        })
    }

    /// `created_at` of the cap-th action in the window, if the window holds that many.
    async fn cap_boundary(&self, request: &FetchRequest) -> Result<Option<NaiveDateTime>> {
        if request.cap == 0 {
            return Ok(None);
        }
        let query = format!(
            "SELECT a.created_at
             FROM {actions} a
             WHERE a.page_id = $1::bigint AND a.created_at {lower} $2 AND a.created_at <= $3
             ORDER BY a.created_at, a.id
             LIMIT 1 OFFSET {offset}",
            actions = qualified_name(self.ak_schema, "core_action"),
            lower = request.lower_operator(),
            offset = request.cap - 1,
        );

        let row = self
            .client
            .query_opt(&query, &[&request.page_id, &request.since, &request.upper])
            .await
            .with_context(|| format!("Failed to find batch boundary for page {}", request.page_id))?;

        Ok(row.map(|row| row.get(0)))
    }
}

/// Parameters: `$1` due cutoff, `$2` first-sync lower bound (NULL for no lookback).
fn build_candidate_query(
    ak_schema: &str,
    survey_schema: &str,
    filter: &PageFilter,
    limit: usize,
) -> String {
    let filter_clause = filter
        .sql_predicate("p.id")
        .map(|predicate| format!(" AND {}", predicate))
        .unwrap_or_default();

    format!(
        "SELECT p.id::bigint, MAX(a.created_at), MAX(sr.last_refresh)
         FROM {pages} p
         JOIN {actions} a ON a.page_id = p.id
         LEFT JOIN {registry} sr ON sr.page_id = p.id
         WHERE p.type = 'Survey'{filter_clause}
         GROUP BY p.id
         HAVING (MAX(sr.last_refresh) IS NULL
                 AND ($2::timestamp IS NULL OR MAX(a.created_at) > $2::timestamp))
             OR (MAX(a.created_at) > MAX(sr.last_refresh)
                 AND MAX(sr.last_refresh) <= $1::timestamp)
         ORDER BY p.id DESC
         LIMIT {limit}",
        pages = qualified_name(ak_schema, "core_page"),
        actions = qualified_name(ak_schema, "core_action"),
        registry = qualified_name(survey_schema, "pages"),
        filter_clause = filter_clause,
        limit = limit,
    )
}

/// Parameters: `$1` page id, `$2` lower bound compared with `lower`, `$3` inclusive upper bound.
fn build_window_query(ak_schema: &str, exclude_fields: &[String], lower: &str) -> String {
    let exclude_clause = if exclude_fields.is_empty() {
        String::new()
    } else {
        let names: Vec<String> = exclude_fields.iter().map(|f| quote_literal(f)).collect();
        format!(" AND af.name NOT IN ({})", names.join(", "))
    };

    format!(
        "SELECT a.id::bigint, af.name::varchar, af.value::varchar, a.created_at
         FROM {actions} a
         LEFT JOIN {fields} af ON af.parent_id = a.id{exclude_clause}
         WHERE a.page_id = $1::bigint AND a.created_at {lower} $2 AND a.created_at <= $3
         ORDER BY a.created_at, a.id, af.id",
        actions = qualified_name(ak_schema, "core_action"),
        fields = qualified_name(ak_schema, "core_actionfield"),
        exclude_clause = exclude_clause,
        lower = lower,
    )
}
