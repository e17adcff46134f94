// ABOUTME: Event command - handles one trigger payload from a file or stdin
// ABOUTME: Always prints a JSON result; failures are reported as {"error": ...}

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

use crate::config::ConfigLayer;
use crate::event::handle_event;

/// Handle the payload at `path` (`-` reads stdin) on top of the `base` config layers.
pub async fn event(path: &Path, base: &[ConfigLayer]) -> Result<()> {
    let raw = if path == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read event payload from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event payload {:?}", path))?
    };

    let payload: serde_json::Value =
        serde_json::from_str(&raw).context("Event payload is not valid JSON")?;
    let response = handle_event(&payload, base).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
