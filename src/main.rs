// ABOUTME: CLI entry point for ak-survey-sync
// ABOUTME: Parses commands, layers configuration, and routes to handlers

use anyhow::{anyhow, Context};
use ak_survey_sync::commands;
use ak_survey_sync::config::{split_column_excludes, ConfigLayer, SyncConfig};
use ak_survey_sync::survey::value::parse_timestamp;
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ak-survey-sync")]
#[command(about = "Incrementally materialize ActionKit survey results into per-survey tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML config file (default: ~/.ak-survey-sync/config.toml if present)
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,
    #[command(flatten)]
    sync: SyncArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct SyncArgs {
    /// ActionKit database connection string (source and destination)
    #[arg(long = "database-url", env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,
    /// Database type: postgresql or redshift
    #[arg(long = "db-type", env = "DB_TYPE", global = true)]
    db_type: Option<String>,
    /// Schema holding the ActionKit tables
    #[arg(long = "ak-schema", env = "DB_SCHEMA_AK", global = true)]
    ak_schema: Option<String>,
    /// Schema holding the pages registry and survey tables
    #[arg(long = "survey-schema", env = "DB_SCHEMA_SURVEY", global = true)]
    survey_schema: Option<String>,
    /// Comma-separated field names never materialized
    #[arg(long = "column-excludes", env = "COLUMN_EXCLUDES", global = true)]
    column_excludes: Option<String>,
    /// Maximum actions per batch
    #[arg(long = "batch-size", env = "BATCH_SIZE", global = true)]
    batch_size: Option<usize>,
    /// Seconds a page's checkpoint must age before it is synced again
    #[arg(long = "refresh-interval", env = "REFRESH_INTERVAL", global = true)]
    refresh_interval: Option<u64>,
    /// Seconds of history a never-synced page starts from
    #[arg(long = "lookback", env = "LOOKBACK", global = true)]
    lookback: Option<u64>,
    /// Sync only these page ids (comma-separated)
    #[arg(long = "include-pages", value_delimiter = ',', global = true)]
    include_pages: Option<Vec<i64>>,
    /// Skip these page ids (comma-separated)
    #[arg(long = "exclude-pages", value_delimiter = ',', global = true)]
    exclude_pages: Option<Vec<i64>>,
    /// Maximum pages per run
    #[arg(long = "max-pages", env = "MAX_PAGES", global = true)]
    max_pages: Option<usize>,
    /// Maximum batches per page per run
    #[arg(long = "max-batches-per-page", global = true)]
    max_batches_per_page: Option<usize>,
    /// Create every new column as text instead of inferring types
    #[arg(long = "no-infer-types", global = true, default_value_t = false)]
    no_infer_types: bool,
    /// Per-statement timeout in seconds
    #[arg(long = "statement-timeout", env = "STATEMENT_TIMEOUT", global = true)]
    statement_timeout: Option<u64>,
    /// Seconds between runs in watch mode
    #[arg(long = "poll-interval", env = "POLL_INTERVAL", global = true)]
    poll_interval: Option<u64>,
}

impl SyncArgs {
    fn to_layer(&self) -> ConfigLayer {
        ConfigLayer {
            database_url: self.database_url.clone(),
            db_type: self.db_type.clone(),
            ak_schema: self.ak_schema.clone(),
            survey_schema: self.survey_schema.clone(),
            column_excludes: self.column_excludes.as_deref().map(split_column_excludes),
            batch_size: self.batch_size,
            refresh_interval_secs: self.refresh_interval,
            lookback_secs: self.lookback,
            include_pages: self.include_pages.clone(),
            exclude_pages: self.exclude_pages.clone(),
            max_pages: self.max_pages,
            max_batches_per_page: self.max_batches_per_page,
            infer_types: self.no_infer_types.then_some(false),
            statement_timeout_secs: self.statement_timeout,
            poll_interval_secs: self.poll_interval,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every survey that needs updating, once
    Run,
    /// Sync every poll interval until Ctrl+C
    Watch,
    /// Catch up one survey page regardless of its refresh interval
    SyncPage {
        #[arg(long = "page-id")]
        page_id: i64,
        /// Re-read actions at or after this timestamp (the checkpoint never moves backwards)
        #[arg(long, value_parser = parse_since)]
        since: Option<NaiveDateTime>,
    },
    /// Show refresh info for one survey page
    Info {
        #[arg(long = "page-id")]
        page_id: i64,
    },
    /// List surveys that need updating
    Due,
    /// Handle a JSON trigger payload from a file, or `-` for stdin
    Event {
        #[arg(long, default_value = "-")]
        payload: PathBuf,
    },
    /// Create the survey schema and page registry
    Init,
    /// Run pre-flight checks for connectivity and permissions
    Check,
}

fn parse_since(value: &str) -> Result<NaiveDateTime, String> {
    parse_timestamp(value.trim()).ok_or_else(|| format!("invalid timestamp '{}'", value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    // Initialize TLS policy using thread-safe OnceLock
    ak_survey_sync::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    let mut layers = Vec::new();
    if let Some(file_layer) = ConfigLayer::load_file(cli.config_path.as_deref())? {
        layers.push(file_layer);
    }
    layers.push(cli.sync.to_layer());

    match cli.command {
        Commands::Event { payload } => commands::event(&payload, &layers).await,
        Commands::Run => commands::run(resolve_config(&layers)?).await,
        Commands::Watch => commands::watch(resolve_config(&layers)?).await,
        Commands::SyncPage { page_id, since } => {
            commands::sync_page(resolve_config(&layers)?, page_id, since).await
        }
        Commands::Info { page_id } => commands::info(resolve_config(&layers)?, page_id).await,
        Commands::Due => commands::due(resolve_config(&layers)?).await,
        Commands::Init => commands::init(resolve_config(&layers)?).await,
        Commands::Check => commands::check(resolve_config(&layers)?).await,
    }
}

fn resolve_config(layers: &[ConfigLayer]) -> anyhow::Result<SyncConfig> {
    let config = SyncConfig::from_layers(layers).context("Invalid configuration")?;
    if config.database_url.is_empty() {
        return Err(anyhow!(
            "No database URL. Use --database-url, DATABASE_URL, or database_url in the config file."
        ));
    }
    Ok(config)
}
