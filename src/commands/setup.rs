// ABOUTME: Setup commands - create the page registry and run pre-flight checks
// ABOUTME: Both are safe to run repeatedly

use anyhow::{bail, Result};

use crate::config::SyncConfig;
use crate::preflight;
use crate::survey::backend::PageRegistry;
use crate::survey::orchestrator;

/// Create the survey schema and page registry if missing, then verify them.
pub async fn init(config: SyncConfig) -> Result<()> {
    let backend = orchestrator::connect_backend(&config).await?;
    backend.ensure_registry().await?;
    backend.verify_registry().await?;
    println!(
        "✓ Page registry {}.pages is ready",
        config.survey_schema
    );
    Ok(())
}

/// Run pre-flight checks and fail if any issue was found.
pub async fn check(config: SyncConfig) -> Result<()> {
    config.validate()?;
    let result = preflight::run_preflight_checks(&config).await?;
    result.print();
    if !result.all_passed() {
        bail!("Pre-flight checks failed with {} issue(s)", result.failed_count());
    }
    Ok(())
}
