// ABOUTME: Typed error taxonomy for survey sync failures
// ABOUTME: Separates page-level failures from fatal setup errors that abort a run

use thiserror::Error;

use crate::survey::value::ValueType;

/// Root causes raised by the survey sync engine.
///
/// Functions still return `anyhow::Result`; these variants sit at the bottom
/// of the context chain so callers can `downcast_ref` to classify a failure.
#[derive(Debug, Error)]
pub enum SurveySyncError {
    #[error("Page {0} not found.")]
    PageNotFound(i64),

    #[error("Page {0} is not a survey.")]
    PageNotSurvey(i64),

    #[error("Results for survey {0} have not yet been loaded.")]
    PageNotLoaded(i64),

    #[error("Invalid page id '{0}'")]
    InvalidPageId(String),

    /// A batch wants to write values of one type into a column of another.
    #[error(
        "Schema conflict on page_{page_id}.{column}: column is {existing} but incoming values are {incoming}"
    )]
    SchemaConflict {
        page_id: i64,
        column: String,
        existing: ValueType,
        incoming: ValueType,
    },

    /// The conditional checkpoint write matched no row.
    #[error("Checkpoint for page {page_id} was changed by another writer")]
    CheckpointConflict { page_id: i64 },

    #[error("Page registry {table} is missing required column(s): {}", missing.join(", "))]
    RegistryInvalid { table: String, missing: Vec<String> },

    #[error("Database type {0} not found.")]
    InvalidDbType(String),
}

impl SurveySyncError {
    /// Fatal errors indicate a misconfigured environment and abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SurveySyncError::RegistryInvalid { .. } | SurveySyncError::InvalidDbType(_)
        )
    }
}

/// Returns true if any error in the chain is a fatal [`SurveySyncError`].
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<SurveySyncError>())
        .any(SurveySyncError::is_fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_registry_invalid_is_fatal() {
        let err = SurveySyncError::RegistryInvalid {
            table: "survey_results.pages".to_string(),
            missing: vec!["last_refresh".to_string()],
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("last_refresh"));
    }

    #[test]
    fn test_page_errors_are_not_fatal() {
        assert!(!SurveySyncError::PageNotSurvey(1).is_fatal());
        assert!(!SurveySyncError::CheckpointConflict { page_id: 1 }.is_fatal());
        assert!(!SurveySyncError::SchemaConflict {
            page_id: 1,
            column: "zip".to_string(),
            existing: ValueType::Numeric,
            incoming: ValueType::Text,
        }
        .is_fatal());
    }

    #[test]
    fn test_is_fatal_walks_context_chain() {
        let result: anyhow::Result<()> = Err(SurveySyncError::RegistryInvalid {
            table: "pages".to_string(),
            missing: vec!["page_id".to_string()],
        })
        .context("Failed to verify registry");
        let err = result.unwrap_err();
        assert!(is_fatal(&err));

        let plain = anyhow::anyhow!("connection reset");
        assert!(!is_fatal(&plain));
    }

    #[test]
    fn test_messages_match_refresh_info_wording() {
        assert_eq!(
            SurveySyncError::PageNotLoaded(7).to_string(),
            "Results for survey 7 have not yet been loaded."
        );
        assert_eq!(SurveySyncError::PageNotFound(0).to_string(), "Page 0 not found.");
    }
}
