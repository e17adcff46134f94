// ABOUTME: PgSurveyBackend - one PostgreSQL/Redshift connection serving source, store, and registry
// ABOUTME: Batch transactions are plain BEGIN/COMMIT on the shared connection

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio_postgres::Client;

use crate::config::{DbType, SyncConfig};
use crate::survey::backend::{
    ActionRow, CandidateQuery, ColumnDef, FetchRequest, PageCandidate, PageInfo, PageRecord,
    PageRegistry, SourceBatch, SurveySource, SurveyStore,
};
use crate::survey::reader::SurveyReader;
use crate::survey::registry::PagesTable;
use crate::survey::writer::SurveyWriter;

/// Survey backend over a single database connection.
pub struct PgSurveyBackend {
    client: Client,
    ak_schema: String,
    survey_schema: String,
    db_type: DbType,
}

impl PgSurveyBackend {
    pub fn new(client: Client, config: &SyncConfig) -> Self {
        Self {
            client,
            ak_schema: config.ak_schema.clone(),
            survey_schema: config.survey_schema.clone(),
            db_type: config.db_type,
        }
    }

    fn reader(&self) -> SurveyReader<'_> {
        SurveyReader::new(&self.client, &self.ak_schema, &self.survey_schema)
    }

    fn writer(&self) -> SurveyWriter<'_> {
        SurveyWriter::new(&self.client, &self.survey_schema, self.db_type)
    }

    fn pages(&self) -> PagesTable<'_> {
        PagesTable::new(&self.client, &self.survey_schema, self.db_type)
    }
}

#[async_trait]
impl SurveySource for PgSurveyBackend {
    async fn candidate_pages(&self, query: &CandidateQuery) -> Result<Vec<PageCandidate>> {
        self.reader().candidate_pages(query).await
    }

    async fn page_info(&self, page_id: i64) -> Result<Option<PageInfo>> {
        self.reader().page_info(page_id).await
    }

    async fn fetch_window(&self, request: &FetchRequest) -> Result<SourceBatch> {
        self.reader().fetch_window(request).await
    }
}

#[async_trait]
impl SurveyStore for PgSurveyBackend {
    async fn table_columns(&self, page_id: i64) -> Result<Option<Vec<ColumnDef>>> {
        self.writer().table_columns(page_id).await
    }

    async fn create_table(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()> {
        self.writer().create_table(page_id, columns).await
    }

    async fn add_columns(&self, page_id: i64, columns: &[ColumnDef]) -> Result<()> {
        self.writer().add_columns(page_id, columns).await
    }

    async fn upsert_rows(&self, page_id: i64, columns: &[ColumnDef], rows: &[ActionRow]) -> Result<u64> {
        self.writer().upsert_rows(page_id, columns, rows).await
    }

    async fn row_count(&self, page_id: i64) -> Result<Option<i64>> {
        self.writer().row_count(page_id).await
    }

    async fn begin(&self) -> Result<()> {
        self.client
            .batch_execute("BEGIN")
            .await
            .context("Failed to begin batch transaction")
    }

    async fn commit(&self) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .context("Failed to commit batch transaction")
    }

    async fn rollback(&self) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .context("Failed to roll back batch transaction")
    }
}

#[async_trait]
impl PageRegistry for PgSurveyBackend {
    async fn ensure_registry(&self) -> Result<()> {
        self.pages().ensure().await
    }

    async fn verify_registry(&self) -> Result<()> {
        self.pages().verify().await
    }

    async fn load_page(&self, page_id: i64) -> Result<Option<PageRecord>> {
        self.pages().load(page_id).await
    }

    async fn register_page(&self, page_id: i64) -> Result<()> {
        self.pages().register(page_id).await
    }

    async fn save_column_list(&self, page_id: i64, columns: &[String]) -> Result<()> {
        self.pages().save_column_list(page_id, columns).await
    }

    async fn advance_checkpoint(
        &self,
        page_id: i64,
        expected: Option<NaiveDateTime>,
        new: NaiveDateTime,
    ) -> Result<bool> {
        self.pages().advance_checkpoint(page_id, expected, new).await
    }
}
