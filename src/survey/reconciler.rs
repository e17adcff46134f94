// ABOUTME: Schema reconciler - widens page_{id} tables to fit the fields in a batch
// ABOUTME: Additive only; persists the page's column_list once the DDL has succeeded

use anyhow::{Context, Result};

use crate::error::SurveySyncError;
use crate::survey::backend::{ColumnDef, PageRegistry, SurveyStore};
use crate::survey::value::ValueType;

/// A field present in the current batch, after column naming and type inference.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub value_type: ValueType,
    /// False when every value in the batch was empty; such a field carries no type evidence.
    pub has_values: bool,
    /// Typed column types at least one non-empty value in the batch parses as.
    /// An existing column of one of these types keeps the field: values that
    /// do not parse degrade to NULL on write.
    pub parses_as: Vec<ValueType>,
}

impl FieldDefinition {
    /// True when an existing column of type `column` cannot hold this field.
    pub fn conflicts_with(&self, column: ValueType) -> bool {
        self.has_values && !column.accepts(self.value_type) && !self.parses_as.contains(&column)
    }
}

/// What reconciliation did to the table.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Every field column of the table after reconciliation, in table order.
    pub columns: Vec<ColumnDef>,
    pub added: Vec<ColumnDef>,
    pub created: bool,
}

impl ReconcileOutcome {
    pub fn column_type(&self, name: &str) -> Option<ValueType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value_type)
    }

    pub fn ddl_issued(&self) -> bool {
        self.created || !self.added.is_empty()
    }
}

pub struct SchemaReconciler<'a, B: ?Sized> {
    backend: &'a B,
    infer_types: bool,
}

impl<'a, B> SchemaReconciler<'a, B>
where
    B: SurveyStore + PageRegistry + ?Sized,
{
    pub fn new(backend: &'a B, infer_types: bool) -> Self {
        Self {
            backend,
            infer_types,
        }
    }

    /// Make `page_{id}` hold every field in `fields`.
    ///
    /// The table's actual columns are authoritative; `recorded` is the
    /// registry's column_list and is rewritten whenever it disagrees with the
    /// table, which repairs a crash between DDL and the registry write.
    pub async fn reconcile(
        &self,
        page_id: i64,
        recorded: &[String],
        fields: &[FieldDefinition],
    ) -> Result<ReconcileOutcome> {
        let existing = self.backend.table_columns(page_id).await?;

        let outcome = match existing {
            None => {
                let mut columns: Vec<ColumnDef> =
                    fields.iter().map(|f| self.column_for(f)).collect();
                columns.sort_by(|a, b| a.name.cmp(&b.name));

                self.backend
                    .create_table(page_id, &columns)
                    .await
                    .with_context(|| format!("Failed to create table for page {}", page_id))?;
                tracing::info!(
                    "Created table page_{} with {} field column(s)",
                    page_id,
                    columns.len()
                );

                ReconcileOutcome {
                    added: columns.clone(),
                    columns,
                    created: true,
                }
            }
            Some(existing) => {
                let mut missing = Vec::new();
                for field in fields {
                    match existing.iter().find(|c| c.name == field.name) {
                        Some(column) => {
                            if field.conflicts_with(column.value_type) {
                                return Err(SurveySyncError::SchemaConflict {
                                    page_id,
                                    column: field.name.clone(),
                                    existing: column.value_type,
                                    incoming: field.value_type,
                                }
                                .into());
                            }
                        }
                        None => missing.push(self.column_for(field)),
                    }
                }
                missing.sort_by(|a, b| a.name.cmp(&b.name));

                if !missing.is_empty() {
                    self.backend
                        .add_columns(page_id, &missing)
                        .await
                        .with_context(|| format!("Failed to add columns to page {}", page_id))?;
                    tracing::info!(
                        "Added {} column(s) to page_{}: {}",
                        missing.len(),
                        page_id,
                        missing
                            .iter()
                            .map(|c| c.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }

                let mut columns = existing;
                columns.extend(missing.iter().cloned());
                ReconcileOutcome {
                    columns,
                    added: missing,
                    created: false,
                }
            }
        };

        let column_list: Vec<String> = outcome.columns.iter().map(|c| c.name.clone()).collect();
        if column_list.as_slice() != recorded {
            self.backend
                .save_column_list(page_id, &column_list)
                .await
                .with_context(|| format!("Failed to record columns for page {}", page_id))?;
        }

        Ok(outcome)
    }

    fn column_for(&self, field: &FieldDefinition) -> ColumnDef {
        let value_type = if self.infer_types {
            field.value_type
        } else {
            ValueType::Text
        };
        ColumnDef::new(field.name.clone(), value_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::memory::MemoryBackend;

    fn field(name: &str, value_type: ValueType) -> FieldDefinition {
        let parses_as = match value_type {
            ValueType::Text => Vec::new(),
            typed => vec![typed],
        };
        FieldDefinition {
            name: name.to_string(),
            value_type,
            has_values: true,
            parses_as,
        }
    }

    async fn registered(page_id: i64) -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.register_page(page_id).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_creates_missing_table_with_sorted_columns() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, true);

        let outcome = reconciler
            .reconcile(
                1,
                &[],
                &[field("zip", ValueType::Text), field("age", ValueType::Numeric)],
            )
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(backend.table(1).unwrap().column_names(), vec!["age", "zip"]);
        assert_eq!(backend.page_record(1).unwrap().column_list, vec!["age", "zip"]);
        assert_eq!(outcome.column_type("age"), Some(ValueType::Numeric));
    }

    #[tokio::test]
    async fn test_adds_only_missing_columns() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, true);
        reconciler
            .reconcile(1, &[], &[field("email", ValueType::Text)])
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(
                1,
                &["email".to_string()],
                &[field("email", ValueType::Text), field("zip", ValueType::Text)],
            )
            .await
            .unwrap();

        assert!(!outcome.created);
        assert_eq!(outcome.added, vec![ColumnDef::new("zip", ValueType::Text)]);
        assert_eq!(backend.table(1).unwrap().column_names(), vec!["email", "zip"]);
        assert_eq!(backend.ddl_count(), 2);
    }

    #[tokio::test]
    async fn test_no_missing_columns_is_a_noop() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, true);
        reconciler
            .reconcile(1, &[], &[field("email", ValueType::Text)])
            .await
            .unwrap();
        let ddl_before = backend.ddl_count();

        let outcome = reconciler
            .reconcile(1, &["email".to_string()], &[field("email", ValueType::Text)])
            .await
            .unwrap();

        assert!(!outcome.ddl_issued());
        assert_eq!(backend.ddl_count(), ddl_before);
    }

    #[tokio::test]
    async fn test_incompatible_type_is_schema_conflict() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, true);
        reconciler
            .reconcile(1, &[], &[field("age", ValueType::Numeric)])
            .await
            .unwrap();

        let err = reconciler
            .reconcile(1, &["age".to_string()], &[field("age", ValueType::Text)])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SurveySyncError>(),
            Some(SurveySyncError::SchemaConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_mostly_numeric_field_keeps_numeric_column() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, true);
        reconciler
            .reconcile(1, &[], &[field("age", ValueType::Numeric)])
            .await
            .unwrap();

        // one "n/a" among numbers resolves the batch to text
        let mixed = FieldDefinition {
            name: "age".to_string(),
            value_type: ValueType::Text,
            has_values: true,
            parses_as: vec![ValueType::Numeric],
        };
        let outcome = reconciler
            .reconcile(1, &["age".to_string()], &[mixed])
            .await
            .unwrap();

        assert!(!outcome.ddl_issued());
        assert_eq!(outcome.column_type("age"), Some(ValueType::Numeric));
    }

    #[tokio::test]
    async fn test_text_column_accepts_typed_values() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, true);
        reconciler
            .reconcile(1, &[], &[field("answer", ValueType::Text)])
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(1, &["answer".to_string()], &[field("answer", ValueType::Numeric)])
            .await
            .unwrap();
        assert_eq!(outcome.column_type("answer"), Some(ValueType::Text));
    }

    #[tokio::test]
    async fn test_ddl_failure_leaves_column_list_untouched() {
        let backend = registered(1).await;
        backend.fail_ddl(1);
        let reconciler = SchemaReconciler::new(&backend, true);

        assert!(reconciler
            .reconcile(1, &[], &[field("email", ValueType::Text)])
            .await
            .is_err());
        assert!(backend.page_record(1).unwrap().column_list.is_empty());
    }

    #[tokio::test]
    async fn test_stale_column_list_is_repaired() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, true);
        reconciler
            .reconcile(1, &[], &[field("email", ValueType::Text)])
            .await
            .unwrap();
        backend.save_column_list(1, &[]).await.unwrap();

        reconciler
            .reconcile(1, &[], &[field("email", ValueType::Text)])
            .await
            .unwrap();
        assert_eq!(backend.page_record(1).unwrap().column_list, vec!["email"]);
    }

    #[tokio::test]
    async fn test_without_inference_columns_are_text() {
        let backend = registered(1).await;
        let reconciler = SchemaReconciler::new(&backend, false);
        let outcome = reconciler
            .reconcile(1, &[], &[field("age", ValueType::Numeric)])
            .await
            .unwrap();
        assert_eq!(outcome.column_type("age"), Some(ValueType::Text));
    }
}
