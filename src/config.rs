// ABOUTME: Sync configuration - one immutable struct handed to the orchestrator
// ABOUTME: Built from defaults, a TOML file, environment/CLI flags, and event payloads

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::SurveySyncError;
use crate::filters::PageFilter;

/// Destination dialect. Source and destination always share one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbType {
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "redshift")]
    Redshift,
}

impl FromStr for DbType {
    type Err = SurveySyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DbType::PostgreSql),
            "redshift" => Ok(DbType::Redshift),
            _ => Err(SurveySyncError::InvalidDbType(value.to_string())),
        }
    }
}

/// Everything a sync run needs. Never read from ambient state after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub database_url: String,
    pub db_type: DbType,
    /// Schema holding the ActionKit `core_page`, `core_action`, `core_actionfield` tables
    pub ak_schema: String,
    /// Schema holding the `pages` registry and the `page_{id}` tables
    pub survey_schema: String,
    /// Source field names that are never materialized
    pub column_excludes: Vec<String>,
    /// Maximum actions per batch
    pub batch_size: usize,
    /// A page is due when its checkpoint is at least this old
    pub refresh_interval: Duration,
    /// Never-synced pages start at `now - lookback` instead of the beginning of time
    pub lookback: Option<Duration>,
    pub page_filter: PageFilter,
    /// Maximum pages discovered per run
    pub max_pages: usize,
    /// Stop catching a page up after this many batches; the rest waits for the next run
    pub max_batches_per_page: Option<usize>,
    /// When false, every new column is created as text
    pub infer_types: bool,
    pub statement_timeout: Option<Duration>,
    /// Interval between runs in `watch` mode
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_type: DbType::PostgreSql,
            ak_schema: "ak".to_string(),
            survey_schema: "survey_results".to_string(),
            column_excludes: Vec::new(),
            batch_size: 10_000,
            refresh_interval: Duration::ZERO,
            lookback: None,
            page_filter: PageFilter::empty(),
            max_pages: 15,
            max_batches_per_page: None,
            infer_types: true,
            statement_timeout: None,
            poll_interval: Duration::from_secs(3600),
        }
    }
}

impl SyncConfig {
    /// Apply layers in order (later layers win) on top of the defaults.
    pub fn from_layers(layers: &[ConfigLayer]) -> Result<Self> {
        let mut config = SyncConfig::default();
        for layer in layers {
            config = layer.apply(config)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that every entry point relies on.
    pub fn validate(&self) -> Result<()> {
        crate::utils::validate_postgres_identifier(&self.ak_schema)
            .context("Invalid ActionKit schema name")?;
        crate::utils::validate_postgres_identifier(&self.survey_schema)
            .context("Invalid survey schema name")?;
        if self.batch_size == 0 {
            bail!("Batch size must be greater than zero");
        }
        if self.max_pages == 0 {
            bail!("Max pages must be greater than zero");
        }
        if self.max_batches_per_page == Some(0) {
            bail!("Max batches per page must be greater than zero");
        }
        if !self.database_url.is_empty() {
            crate::utils::validate_connection_string(&self.database_url)?;
        }
        Ok(())
    }
}

/// One partial source of configuration: a TOML file, the command line, or an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub database_url: Option<String>,
    pub db_type: Option<String>,
    pub ak_schema: Option<String>,
    pub survey_schema: Option<String>,
    pub column_excludes: Option<Vec<String>>,
    pub batch_size: Option<usize>,
    pub refresh_interval_secs: Option<u64>,
    pub lookback_secs: Option<u64>,
    pub include_pages: Option<Vec<i64>>,
    pub exclude_pages: Option<Vec<i64>>,
    pub max_pages: Option<usize>,
    pub max_batches_per_page: Option<usize>,
    pub infer_types: Option<bool>,
    pub statement_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

impl ConfigLayer {
    /// Load a layer from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let layer: ConfigLayer = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(layer)
    }

    /// Default config file location: `~/.ak-survey-sync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ak-survey-sync").join("config.toml"))
    }

    /// Load the explicit path if given, else the default path if it exists.
    pub fn load_file(explicit: Option<&Path>) -> Result<Option<Self>> {
        if let Some(path) = explicit {
            return Ok(Some(Self::load(path)?));
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading config from {:?}", path);
                Ok(Some(Self::load(&path)?))
            }
            _ => Ok(None),
        }
    }

    fn apply(&self, mut config: SyncConfig) -> Result<SyncConfig> {
        if let Some(ref url) = self.database_url {
            config.database_url = url.clone();
        }
        if let Some(ref db_type) = self.db_type {
            config.db_type = db_type.parse()?;
        }
        if let Some(ref schema) = self.ak_schema {
            config.ak_schema = schema.clone();
        }
        if let Some(ref schema) = self.survey_schema {
            config.survey_schema = schema.clone();
        }
        if let Some(ref excludes) = self.column_excludes {
            config.column_excludes = excludes
                .iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(secs) = self.refresh_interval_secs {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.lookback_secs {
            config.lookback = Some(Duration::from_secs(secs));
        }
        if self.include_pages.is_some() || self.exclude_pages.is_some() {
            config.page_filter =
                PageFilter::new(self.include_pages.clone(), self.exclude_pages.clone())?;
        }
        if let Some(max_pages) = self.max_pages {
            config.max_pages = max_pages;
        }
        if let Some(max_batches) = self.max_batches_per_page {
            config.max_batches_per_page = Some(max_batches);
        }
        if let Some(infer_types) = self.infer_types {
            config.infer_types = infer_types;
        }
        if let Some(secs) = self.statement_timeout_secs {
            config.statement_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Split a comma-separated exclude list the way `COLUMN_EXCLUDES` is written.
pub fn split_column_excludes(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.max_pages, 15);
        assert_eq!(config.ak_schema, "ak");
        assert_eq!(config.survey_schema, "survey_results");
        assert_eq!(config.refresh_interval, Duration::ZERO);
        assert!(config.infer_types);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_db_type_parse() {
        assert_eq!("PostgreSQL".parse::<DbType>().unwrap(), DbType::PostgreSql);
        assert_eq!("redshift".parse::<DbType>().unwrap(), DbType::Redshift);
        let err = "mysql".parse::<DbType>().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_later_layers_win() {
        let file = ConfigLayer {
            batch_size: Some(500),
            survey_schema: Some("surveys".to_string()),
            ..Default::default()
        };
        let cli = ConfigLayer {
            batch_size: Some(50),
            ..Default::default()
        };
        let config = SyncConfig::from_layers(&[file, cli]).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.survey_schema, "surveys");
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let layer = ConfigLayer {
            survey_schema: Some("bad-schema".to_string()),
            ..Default::default()
        };
        assert!(SyncConfig::from_layers(&[layer]).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let layer = ConfigLayer {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(SyncConfig::from_layers(&[layer]).is_err());
    }

    #[test]
    fn test_split_column_excludes() {
        assert_eq!(
            split_column_excludes("email, zip,,"),
            vec!["email".to_string(), "zip".to_string()]
        );
        assert!(split_column_excludes("").is_empty());
    }

    #[test]
    fn test_toml_layer() {
        let layer: ConfigLayer = toml::from_str(
            r#"
            db_type = "redshift"
            column_excludes = ["source", "referring_akid"]
            lookback_secs = 86400
            include_pages = [4, 5]
            "#,
        )
        .unwrap();
        let config = SyncConfig::from_layers(&[layer]).unwrap();
        assert_eq!(config.db_type, DbType::Redshift);
        assert_eq!(config.column_excludes.len(), 2);
        assert_eq!(config.lookback, Some(Duration::from_secs(86400)));
        assert!(config.page_filter.should_sync_page(4));
        assert!(!config.page_filter.should_sync_page(6));
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        let parsed: Result<ConfigLayer, _> = toml::from_str("batchsize = 5");
        assert!(parsed.is_err());
    }
}
