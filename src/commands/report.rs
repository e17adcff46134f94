// ABOUTME: Reporting commands - refresh info for one survey and the due listing
// ABOUTME: Results are printed as pretty JSON

use anyhow::Result;

use crate::config::SyncConfig;
use crate::survey::{info as survey_info, orchestrator};

/// Print refresh info for one survey page.
pub async fn info(config: SyncConfig, page_id: i64) -> Result<()> {
    let backend = orchestrator::connect_backend(&config).await?;
    let info = survey_info::refresh_info(&backend, page_id).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// Print the surveys that need updating.
pub async fn due(config: SyncConfig) -> Result<()> {
    let backend = orchestrator::connect_backend(&config).await?;
    let pages = survey_info::due_pages(&backend, &config, orchestrator::now()).await?;
    if pages.is_empty() {
        tracing::info!("No surveys need updating");
    }
    println!("{}", serde_json::to_string_pretty(&pages)?);
    Ok(())
}
