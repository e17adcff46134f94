// ABOUTME: PagesTable - the survey registry mapping page_id to column_list and last_refresh
// ABOUTME: Checkpoint writes are conditional on the previously read value

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tokio_postgres::Client;

use crate::config::DbType;
use crate::error::SurveySyncError;
use crate::survey::backend::PageRecord;
use crate::survey::value::ValueType;
use crate::utils::{qualified_name, quote_ident};

pub const REGISTRY_TABLE: &str = "pages";

const REQUIRED_COLUMNS: &[&str] = &["page_id", "column_list", "last_refresh"];

/// Access to `{survey_schema}.pages`.
pub struct PagesTable<'a> {
    client: &'a Client,
    schema: &'a str,
    db_type: DbType,
}

impl<'a> PagesTable<'a> {
    pub fn new(client: &'a Client, schema: &'a str, db_type: DbType) -> Self {
        Self {
            client,
            schema,
            db_type,
        }
    }

    fn table(&self) -> String {
        qualified_name(self.schema, REGISTRY_TABLE)
    }

    pub async fn ensure(&self) -> Result<()> {
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {table} (
                 page_id BIGINT PRIMARY KEY,
                 column_list {text},
                 last_refresh TIMESTAMP
             )",
            schema = quote_ident(self.schema),
            table = self.table(),
            text = ValueType::Text.sql_type(self.db_type),
        );
        self.client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("Failed to create page registry {}", self.table()))?;
        tracing::debug!("Page registry {} is ready", self.table());
        Ok(())
    }

    pub async fn verify(&self) -> Result<()> {
        let rows = self
            .client
            .query(
                "SELECT column_name::varchar
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2",
                &[&self.schema, &REGISTRY_TABLE],
            )
            .await
            .with_context(|| format!("Failed to inspect page registry {}", self.table()))?;

        let present: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        let missing = missing_columns(&present);
        if !missing.is_empty() {
            return Err(SurveySyncError::RegistryInvalid {
                table: format!("{}.{}", self.schema, REGISTRY_TABLE),
                missing,
            }
            .into());
        }
        Ok(())
    }

    pub async fn load(&self, page_id: i64) -> Result<Option<PageRecord>> {
        let query = format!(
            "SELECT page_id::bigint, column_list::varchar, last_refresh
             FROM {}
             WHERE page_id = $1::bigint",
            self.table()
        );
        let row = self
            .client
            .query_opt(&query, &[&page_id])
            .await
            .with_context(|| format!("Failed to load registry record for page {}", page_id))?;

        Ok(row.map(|row| {
            let column_list: Option<String> = row.get(1);
            PageRecord {
                page_id: row.get(0),
                column_list: split_column_list(column_list.as_deref().unwrap_or("")),
                last_refresh: row.get(2),
            }
        }))
    }

    /// Insert a never-synced record unless one exists.
    pub async fn register(&self, page_id: i64) -> Result<()> {
        let query = format!(
            "INSERT INTO {table} (page_id, column_list)
             SELECT $1::bigint, ''
             WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE page_id = $1::bigint)",
            table = self.table()
        );
        self.client
            .execute(&query, &[&page_id])
            .await
            .with_context(|| format!("Failed to register page {}", page_id))?;
        Ok(())
    }

    pub async fn save_column_list(&self, page_id: i64, columns: &[String]) -> Result<()> {
        let query = format!(
            "UPDATE {} SET column_list = $2 WHERE page_id = $1::bigint",
            self.table()
        );
        let joined = columns.join(",");
        self.client
            .execute(&query, &[&page_id, &joined])
            .await
            .with_context(|| format!("Failed to save column list for page {}", page_id))?;
        Ok(())
    }

    /// Compare-and-set on `last_refresh`. Returns false if no row matched.
    pub async fn advance_checkpoint(
        &self,
        page_id: i64,
        expected: Option<NaiveDateTime>,
        new: NaiveDateTime,
    ) -> Result<bool> {
        let query = format!(
            "UPDATE {}
             SET last_refresh = $2::timestamp
             WHERE page_id = $1::bigint
               AND (last_refresh = $3::timestamp
                    OR (last_refresh IS NULL AND $3::timestamp IS NULL))",
            self.table()
        );
        let updated = self
            .client
            .execute(&query, &[&page_id, &new, &expected])
            .await
            .with_context(|| format!("Failed to advance checkpoint for page {}", page_id))?;
        Ok(updated == 1)
    }
}

fn missing_columns(present: &[String]) -> Vec<String> {
    REQUIRED_COLUMNS
        .iter()
        .filter(|required| !present.iter().any(|c| c == *required))
        .map(|c| c.to_string())
        .collect()
}

/// Column lists are stored comma-joined; column names never contain commas.
pub fn split_column_list(stored: &str) -> Vec<String> {
    stored
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_columns() {
        let present = vec!["page_id".to_string(), "column_list".to_string()];
        assert_eq!(missing_columns(&present), vec!["last_refresh".to_string()]);
        assert_eq!(missing_columns(&[]).len(), 3);
    }

    #[test]
    fn test_split_column_list() {
        assert_eq!(split_column_list("email,zip"), vec!["email", "zip"]);
        assert!(split_column_list("").is_empty());
        assert_eq!(split_column_list("a,,b"), vec!["a", "b"]);
    }
}
