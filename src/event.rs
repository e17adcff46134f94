// ABOUTME: Event-payload adapter for trigger-driven invocation
// ABOUTME: Translates FUNCTION/PAGE_ID/SINCE payloads into config and a JSON result

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDateTime;
use serde_json::{json, Map, Value};
use std::str::FromStr;

use crate::config::{split_column_excludes, ConfigLayer, SyncConfig};
use crate::error::SurveySyncError;
use crate::survey::backend::SurveyBackend;
use crate::survey::value::parse_timestamp;
use crate::survey::{info, orchestrator};

/// Operations an event can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFunction {
    SurveyRefreshInfo,
    SurveysThatNeedUpdating,
    ProcessSurveysThatNeedUpdating,
    ProcessRecentActionsForSurvey,
}

impl FromStr for EventFunction {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "survey_refresh_info" => Ok(EventFunction::SurveyRefreshInfo),
            "surveys_that_need_updating" => Ok(EventFunction::SurveysThatNeedUpdating),
            "process_surveys_that_need_updating" => {
                Ok(EventFunction::ProcessSurveysThatNeedUpdating)
            }
            "process_recent_actions_for_survey" => Ok(EventFunction::ProcessRecentActionsForSurvey),
            other => bail!("Unknown FUNCTION '{}'", other),
        }
    }
}

/// A parsed event: what to run and the configuration it overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRequest {
    pub function: EventFunction,
    pub page_id: Option<i64>,
    pub since: Option<NaiveDateTime>,
    pub overrides: ConfigLayer,
}

impl EventRequest {
    /// Parse a payload. Keys in a nested `kwargs` object replace top-level keys.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let mut event: Map<String, Value> = payload
            .as_object()
            .cloned()
            .ok_or_else(|| anyhow!("Event payload must be a JSON object"))?;
        if let Some(Value::Object(kwargs)) = event.remove("kwargs") {
            for (key, value) in kwargs {
                event.insert(key, value);
            }
        }

        let function: EventFunction = string_field(&event, "FUNCTION")?
            .ok_or_else(|| anyhow!("Event payload has no FUNCTION"))?
            .parse()?;

        let page_id = match event.get("PAGE_ID").filter(|v| is_present(v)) {
            None => None,
            Some(Value::Number(n)) => Some(
                n.as_i64()
                    .ok_or_else(|| SurveySyncError::InvalidPageId(n.to_string()))?,
            ),
            Some(Value::String(s)) => Some(
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| SurveySyncError::InvalidPageId(s.clone()))?,
            ),
            Some(other) => return Err(SurveySyncError::InvalidPageId(other.to_string()).into()),
        };

        let since = match string_field(&event, "SINCE")? {
            None => None,
            Some(raw) => Some(
                parse_timestamp(raw.trim())
                    .ok_or_else(|| anyhow!("Invalid SINCE timestamp '{}'", raw))?,
            ),
        };

        let overrides = ConfigLayer {
            db_type: string_field(&event, "DB_TYPE")?,
            ak_schema: string_field(&event, "DB_SCHEMA_AK")?,
            survey_schema: string_field(&event, "DB_SCHEMA_SURVEY")?,
            column_excludes: match event.get("COLUMN_EXCLUDES").filter(|v| is_present(v)) {
                None => None,
                Some(Value::String(s)) => Some(split_column_excludes(s)),
                Some(Value::Array(items)) => Some(
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                ),
                Some(other) => bail!("COLUMN_EXCLUDES must be a string or list, got {}", other),
            },
            batch_size: uint_field(&event, "BATCH_SIZE")?.map(|n| n as usize),
            refresh_interval_secs: uint_field(&event, "REFRESH_INTERVAL")?,
            lookback_secs: uint_field(&event, "LOOKBACK")?,
            max_pages: uint_field(&event, "MAX_PAGES")?.map(|n| n as usize),
            ..Default::default()
        };

        Ok(Self {
            function,
            page_id,
            since,
            overrides,
        })
    }

    /// Build the run configuration: `base` layers, then this event's overrides.
    pub fn resolve_config(&self, base: &[ConfigLayer]) -> Result<SyncConfig> {
        let mut layers = base.to_vec();
        layers.push(self.overrides.clone());
        SyncConfig::from_layers(&layers)
    }

    fn require_page_id(&self) -> Result<i64> {
        self.page_id
            .ok_or_else(|| SurveySyncError::InvalidPageId(String::new()).into())
    }
}

// Absent, null, false, and "" all mean "not given".
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn string_field(event: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match event.get(key).filter(|v| is_present(v)) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => bail!("{} must be a string, got {}", key, other),
    }
}

fn uint_field(event: &Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match event.get(key).filter(|v| is_present(v)) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a non-negative integer, got {}", key, n)),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got '{}'", key, s)),
        Some(other) => bail!("{} must be a non-negative integer, got {}", key, other),
    }
}

/// Run `request` against `backend` and return its JSON result.
pub async fn dispatch<B>(
    backend: &B,
    config: &SyncConfig,
    request: &EventRequest,
    now: NaiveDateTime,
) -> Result<Value>
where
    B: SurveyBackend + ?Sized,
{
    tracing::info!(
        "Handling event {:?} (page {:?}, since {:?})",
        request.function,
        request.page_id,
        request.since
    );
    let result = match request.function {
        EventFunction::SurveyRefreshInfo => {
            let page_id = request.require_page_id()?;
            serde_json::to_value(info::refresh_info(backend, page_id).await?)?
        }
        EventFunction::SurveysThatNeedUpdating => {
            serde_json::to_value(info::due_pages(backend, config, now).await?)?
        }
        EventFunction::ProcessSurveysThatNeedUpdating => {
            serde_json::to_value(orchestrator::execute_with(backend, config, now, None).await?)?
        }
        EventFunction::ProcessRecentActionsForSurvey => {
            let page_id = request.require_page_id()?;
            let outcome =
                orchestrator::execute_page(backend, config, page_id, request.since, now).await?;
            serde_json::to_value(outcome)?
        }
    };
    Ok(result)
}

/// Error body returned to the trigger instead of failing the invocation.
pub fn error_response(err: &anyhow::Error) -> Value {
    json!({ "error": format!("{:#}", err) })
}

/// Handle a raw payload end to end. Never fails; errors become `{"error": ...}`.
pub async fn handle_event(payload: &Value, base: &[ConfigLayer]) -> Value {
    let outcome = async {
        let request = EventRequest::from_payload(payload)?;
        let config = request.resolve_config(base)?;
        let backend = orchestrator::connect_backend(&config).await?;
        dispatch(&backend, &config, &request, orchestrator::now()).await
    }
    .await;

    match outcome {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Event failed: {:?}", e);
            error_response(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_payload() {
        let request = EventRequest::from_payload(&json!({
            "FUNCTION": "process_recent_actions_for_survey",
            "PAGE_ID": "42",
            "SINCE": "2018-10-01 00:00:00"
        }))
        .unwrap();
        assert_eq!(request.function, EventFunction::ProcessRecentActionsForSurvey);
        assert_eq!(request.page_id, Some(42));
        assert!(request.since.is_some());
    }

    #[test]
    fn test_kwargs_override_top_level() {
        let request = EventRequest::from_payload(&json!({
            "FUNCTION": "survey_refresh_info",
            "PAGE_ID": 1,
            "kwargs": {"PAGE_ID": 7, "BATCH_SIZE": "500"}
        }))
        .unwrap();
        assert_eq!(request.page_id, Some(7));
        assert_eq!(request.overrides.batch_size, Some(500));
    }

    #[test]
    fn test_false_and_empty_values_are_absent() {
        let request = EventRequest::from_payload(&json!({
            "FUNCTION": "surveys_that_need_updating",
            "PAGE_ID": false,
            "SINCE": "",
            "DB_TYPE": null
        }))
        .unwrap();
        assert_eq!(request.page_id, None);
        assert_eq!(request.since, None);
        assert_eq!(request.overrides.db_type, None);
    }

    #[test]
    fn test_invalid_page_id() {
        let err = EventRequest::from_payload(&json!({
            "FUNCTION": "survey_refresh_info",
            "PAGE_ID": "abc"
        }))
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SurveySyncError>(),
            Some(SurveySyncError::InvalidPageId(_))
        ));
    }

    #[test]
    fn test_unknown_function() {
        assert!(EventRequest::from_payload(&json!({"FUNCTION": "drop_everything"})).is_err());
        assert!(EventRequest::from_payload(&json!({})).is_err());
        assert!(EventRequest::from_payload(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_column_excludes_accepts_string_or_list() {
        let from_string = EventRequest::from_payload(&json!({
            "FUNCTION": "surveys_that_need_updating",
            "COLUMN_EXCLUDES": "source, akid"
        }))
        .unwrap();
        let from_list = EventRequest::from_payload(&json!({
            "FUNCTION": "surveys_that_need_updating",
            "COLUMN_EXCLUDES": ["source", "akid"]
        }))
        .unwrap();
        assert_eq!(from_string.overrides.column_excludes, from_list.overrides.column_excludes);
    }

    #[test]
    fn test_error_response_shape() {
        let err = anyhow::Error::from(SurveySyncError::PageNotFound(9));
        assert_eq!(error_response(&err), json!({"error": "Page 9 not found."}));
    }
}
