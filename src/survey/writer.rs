// ABOUTME: SurveyWriter - creates, widens, and upserts into the page_{id} tables
// ABOUTME: Uses ON CONFLICT upserts on PostgreSQL and delete-then-insert on Redshift

use anyhow::{Context, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::config::DbType;
use crate::survey::backend::{ActionRow, ColumnDef};
use crate::survey::columns::{ACTION_ID_COLUMN, CREATED_AT_COLUMN};
use crate::survey::value::ValueType;
use crate::utils::{page_table_name, qualified_name, quote_ident};

// PostgreSQL has a limit of ~65535 parameters per query
const MAX_PARAMS: usize = 65000;

/// How rows are made idempotent on `action_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// `INSERT ... ON CONFLICT (action_id) DO UPDATE`
    OnConflict,
    /// `DELETE ... WHERE action_id IN (...)` then `INSERT`, for tables without a key
    DeleteInsert,
}

/// Writes survey rows to `page_{id}` tables in the survey schema.
pub struct SurveyWriter<'a> {
    client: &'a Client,
    schema: &'a str,
    db_type: DbType,
}

impl<'a> SurveyWriter<'a> {
    pub fn new(client: &'a Client, schema: &'a str, db_type: DbType) -> Self {
        Self {
            client,
            schema,
            db_type,
        }
    }

    /// Field columns of `page_{id}` in ordinal order, or `None` if the table is missing.
    pub async fn table_columns(&self, page_id: i64) -> Result<Option<Vec<ColumnDef>>> {
        let table = page_table_name(page_id);
        let rows = self
            .client
            .query(
                "SELECT column_name::varchar, data_type::varchar
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}.{}", self.schema, table))?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            rows.iter()
                .filter_map(|row| {
                    let name: String = row.get(0);
                    let data_type: String = row.get(1);
                    if name == ACTION_ID_COLUMN || name == CREATED_AT_COLUMN {
                        return None;
                    }
                    Some(ColumnDef::new(name, ValueType::from_data_type(&data_type)))
                })
                .collect(),
        ))
    }

    pub async fn create_table(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()> {
        let table = page_table_name(page_id);
        let ddl = build_create_table(self.schema, &table, columns, self.db_type);
        tracing::debug!("{}", ddl);
        self.client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("Failed to create table {}.{}", self.schema, table))?;
        Ok(())
    }

    /// Add columns one statement at a time; Redshift accepts a single ADD COLUMN per ALTER.
    pub async fn add_columns(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()> {
        let table = page_table_name(page_id);
        for column in columns {
            let ddl = build_add_column(self.schema, &table, column, self.db_type);
            tracing::debug!("{}", ddl);
            self.client.batch_execute(&ddl).await.with_context(|| {
                format!(
                    "Failed to add column {} to {}.{}",
                    column.name, self.schema, table
                )
            })?;
        }
        Ok(())
    }

    /// Upsert mode for `page_{id}`: Redshift never enforces keys, and tables
    /// created before `action_id` became the primary key have none either.
    pub async fn upsert_mode(&self, page_id: i64) -> Result<UpsertMode> {
        if self.db_type == DbType::Redshift {
            return Ok(UpsertMode::DeleteInsert);
        }
        let table = page_table_name(page_id);
        let rows = self
            .client
            .query(
                "SELECT a.attname::varchar
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}.{}", self.schema, table))?;

        let key: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        if key == [ACTION_ID_COLUMN] {
            Ok(UpsertMode::OnConflict)
        } else {
            tracing::debug!(
                "{}.{} has no action_id primary key; using delete-then-insert",
                self.schema,
                table
            );
            Ok(UpsertMode::DeleteInsert)
        }
    }

    /// Write rows keyed by `action_id`, overwriting the given columns of existing rows.
    ///
    /// Callers run this inside the batch transaction; the delete-then-insert
    /// path relies on it.
    pub async fn upsert_rows(
        &self,
        page_id: i64,
        columns: &[ColumnDef],
        rows: &[ActionRow],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table = page_table_name(page_id);
        let mode = self.upsert_mode(page_id).await?;
        let params_per_row = columns.len() + 2;
        let chunk_size = std::cmp::max(1, MAX_PARAMS / params_per_row);

        let mut total_written = 0u64;
        for chunk in rows.chunks(chunk_size) {
            if mode == UpsertMode::DeleteInsert {
                self.delete_actions(&table, chunk).await?;
            }

            let query = build_insert_query(self.schema, &table, columns, chunk.len(), mode);
            let values = row_params(columns, chunk);
            let params: Vec<&(dyn ToSql + Sync)> = values
                .iter()
                .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                .collect();

            let written = self
                .client
                .execute(&query, &params)
                .await
                .with_context(|| format!("Failed to upsert batch into {}.{}", self.schema, table))?;
            total_written += written;
        }

        Ok(total_written)
    }

    async fn delete_actions(&self, table: &str, rows: &[ActionRow]) -> Result<u64> {
        let query = build_delete_query(self.schema, table, rows.len());
        let ids: Vec<i64> = rows.iter().map(|r| r.action_id).collect();
        let params: Vec<&(dyn ToSql + Sync)> =
            ids.iter().map(|id| id as &(dyn ToSql + Sync)).collect();

        self.client
            .execute(&query, &params)
            .await
            .with_context(|| format!("Failed to delete replaced rows from {}.{}", self.schema, table))
    }

    /// `None` if `page_{id}` does not exist.
    pub async fn row_count(&self, page_id: i64) -> Result<Option<i64>> {
        if self.table_columns(page_id).await?.is_none() {
            return Ok(None);
        }
        let table = page_table_name(page_id);
        let row = self
            .client
            .query_one(
                &format!("SELECT COUNT(*) FROM {}", qualified_name(self.schema, &table)),
                &[],
            )
            .await
            .with_context(|| format!("Failed to count rows in {}.{}", self.schema, table))?;
        Ok(Some(row.get(0)))
    }
}

fn row_params(columns: &[ColumnDef], rows: &[ActionRow]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
        Vec::with_capacity(rows.len() * (columns.len() + 2));
    for row in rows {
        params.push(Box::new(row.action_id));
        params.push(Box::new(row.created_at));
        for (column, value) in columns.iter().zip(&row.values) {
            params.push(value.to_sql(column.value_type));
        }
    }
    params
}

fn placeholder(index: usize, value_type: ValueType) -> String {
    match value_type {
        ValueType::Text => format!("${}", index),
        ValueType::Numeric => format!("${}::double precision", index),
        ValueType::Boolean => format!("${}::boolean", index),
        ValueType::Timestamp => format!("${}::timestamp", index),
    }
}

/// Build the CREATE TABLE statement for a page:
///
/// ```sql
/// CREATE TABLE "schema"."page_42" (
///   "action_id" BIGINT PRIMARY KEY, "created_at" TIMESTAMP, "email" VARCHAR, ...)
/// ```
fn build_create_table(schema: &str, table: &str, columns: &[ColumnDef], db_type: DbType) -> String {
    let mut definitions = vec![
        format!("{} BIGINT PRIMARY KEY", quote_ident(ACTION_ID_COLUMN)),
        format!("{} TIMESTAMP", quote_ident(CREATED_AT_COLUMN)),
    ];
    definitions.extend(
        columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.value_type.sql_type(db_type))),
    );
    format!(
        "CREATE TABLE {} ({})",
        qualified_name(schema, table),
        definitions.join(", ")
    )
}

fn build_add_column(schema: &str, table: &str, column: &ColumnDef, db_type: DbType) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        qualified_name(schema, table),
        quote_ident(&column.name),
        column.value_type.sql_type(db_type)
    )
}

/// Build a multi-row INSERT. Parameters per row: `action_id`, `created_at`,
/// then one per column. In `OnConflict` mode only the listed columns are
/// overwritten, so columns absent from the batch keep their values.
fn build_insert_query(
    schema: &str,
    table: &str,
    columns: &[ColumnDef],
    num_rows: usize,
    mode: UpsertMode,
) -> String {
    let mut quoted_columns = vec![quote_ident(ACTION_ID_COLUMN), quote_ident(CREATED_AT_COLUMN)];
    quoted_columns.extend(columns.iter().map(|c| quote_ident(&c.name)));

    let per_row = columns.len() + 2;
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let base = row_idx * per_row;
            let mut placeholders = vec![
                format!("${}::bigint", base + 1),
                format!("${}::timestamp", base + 2),
            ];
            placeholders.extend(
                columns
                    .iter()
                    .enumerate()
                    .map(|(col_idx, c)| placeholder(base + col_idx + 3, c.value_type)),
            );
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let mut query = format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_name(schema, table),
        quoted_columns.join(", "),
        value_rows.join(", ")
    );

    if mode == UpsertMode::OnConflict {
        let updates: Vec<String> = quoted_columns
            .iter()
            .skip(1)
            .map(|c| format!("{} = EXCLUDED.{}", c, c))
            .collect();
        query.push_str(&format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            quote_ident(ACTION_ID_COLUMN),
            updates.join(", ")
        ));
    }

    query
}

fn build_delete_query(schema: &str, table: &str, num_rows: usize) -> String {
    let placeholders: Vec<String> = (1..=num_rows).map(|i| format!("${}::bigint", i)).collect();
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        qualified_name(schema, table),
        quote_ident(ACTION_ID_COLUMN),
        placeholders.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("email", ValueType::Text),
            ColumnDef::new("age", ValueType::Numeric),
        ]
    }

    #[test]
    fn test_build_create_table_postgres() {
        let ddl = build_create_table("survey_results", "page_42", &columns(), DbType::PostgreSql);
        assert_eq!(
            ddl,
            "CREATE TABLE \"survey_results\".\"page_42\" (\"action_id\" BIGINT PRIMARY KEY, \"created_at\" TIMESTAMP, \"email\" VARCHAR, \"age\" DOUBLE PRECISION)"
        );
    }

    #[test]
    fn test_build_create_table_redshift_uses_varchar_max() {
        let ddl = build_create_table("s", "page_1", &columns(), DbType::Redshift);
        assert!(ddl.contains("\"email\" VARCHAR(MAX)"));
    }

    #[test]
    fn test_build_add_column() {
        let column = ColumnDef::new("where_q", ValueType::Boolean);
        assert_eq!(
            build_add_column("s", "page_1", &column, DbType::PostgreSql),
            "ALTER TABLE \"s\".\"page_1\" ADD COLUMN \"where_q\" BOOLEAN"
        );
    }

    #[test]
    fn test_build_upsert_query() {
        let query = build_insert_query("s", "page_1", &columns(), 2, UpsertMode::OnConflict);
        assert_eq!(
            query,
            "INSERT INTO \"s\".\"page_1\" (\"action_id\", \"created_at\", \"email\", \"age\") \
             VALUES ($1::bigint, $2::timestamp, $3, $4::double precision), \
             ($5::bigint, $6::timestamp, $7, $8::double precision) \
             ON CONFLICT (\"action_id\") DO UPDATE SET \
             \"created_at\" = EXCLUDED.\"created_at\", \"email\" = EXCLUDED.\"email\", \"age\" = EXCLUDED.\"age\""
        );
    }

    #[test]
    fn test_build_insert_query_for_delete_insert_mode() {
        let query = build_insert_query("s", "page_1", &[], 1, UpsertMode::DeleteInsert);
        assert_eq!(
            query,
            "INSERT INTO \"s\".\"page_1\" (\"action_id\", \"created_at\") VALUES ($1::bigint, $2::timestamp)"
        );
    }

    #[test]
    fn test_build_delete_query() {
        assert_eq!(
            build_delete_query("s", "page_1", 3),
            "DELETE FROM \"s\".\"page_1\" WHERE \"action_id\" IN ($1::bigint, $2::bigint, $3::bigint)"
        );
    }

    #[test]
    fn test_row_params_layout() {
        use crate::survey::value::FieldValue;
        use chrono::NaiveDate;

        let created_at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let rows = vec![ActionRow {
            action_id: 1,
            created_at,
            values: vec![FieldValue::Text("a@b.c".to_string()), FieldValue::Null],
        }];
        assert_eq!(row_params(&columns(), &rows).len(), 4);
    }
}
