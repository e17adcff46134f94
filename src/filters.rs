// ABOUTME: Page filtering for selective survey sync
// ABOUTME: Handles include/exclude lists of survey page ids

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Restricts which survey pages a run touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFilter {
    include_pages: Option<Vec<i64>>,
    exclude_pages: Option<Vec<i64>>,
}

impl PageFilter {
    /// Creates a filter from CLI or config values
    pub fn new(include_pages: Option<Vec<i64>>, exclude_pages: Option<Vec<i64>>) -> Result<Self> {
        if include_pages.is_some() && exclude_pages.is_some() {
            bail!("Cannot use both --include-pages and --exclude-pages");
        }
        if let Some(ref pages) = include_pages {
            if pages.is_empty() {
                bail!("--include-pages requires at least one page id");
            }
        }
        Ok(Self {
            include_pages,
            exclude_pages,
        })
    }

    /// Creates an empty filter (sync every survey)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn should_sync_page(&self, page_id: i64) -> bool {
        if let Some(ref include) = self.include_pages {
            return include.contains(&page_id);
        }
        if let Some(ref exclude) = self.exclude_pages {
            return !exclude.contains(&page_id);
        }
        true
    }

    /// SQL predicate on `column` equivalent to this filter, or None if empty.
    ///
    /// Page ids are integers, so the list is rendered inline.
    pub fn sql_predicate(&self, column: &str) -> Option<String> {
        let render = |ids: &[i64]| {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        if let Some(ref include) = self.include_pages {
            return Some(format!("{} IN ({})", column, render(include)));
        }
        match self.exclude_pages {
            Some(ref exclude) if !exclude.is_empty() => {
                Some(format!("{} NOT IN ({})", column, render(exclude)))
            }
            _ => None,
        }
    }
}
